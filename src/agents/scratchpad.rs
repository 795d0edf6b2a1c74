//! Per-node scratchpad documents.
//!
//! A node owns exactly one scratchpad for its whole lifetime. Appends are
//! read-concatenate-write without conflict protection: only the orchestrator
//! frame driving the node ever writes to it.

use uuid::Uuid;

use super::context::RunContext;
use super::types::OrchestratorError;
use crate::events::EventKind;
use crate::store::{Node, StoreError};
use crate::util::{tail_chars, tail_preview};

/// Return the node's scratchpad id, creating the document on first visit.
pub async fn ensure(ctx: &RunContext, node: &Node) -> Result<Uuid, OrchestratorError> {
    // A crash between create and link leaves an orphan document, never a second link.
    if let Some(id) = node.scratchpad_doc_id {
        return Ok(id);
    }
    let document = ctx
        .store
        .create_document(
            ctx.workspace_id,
            &format!("Scratchpad: {}", node.title),
            &format!("# {}\n", node.title),
        )
        .await?;
    ctx.store.set_node_scratchpad(node.id, document.id).await?;
    ctx.events
        .emit(EventKind::ScratchpadLinked {
            node_id: node.id,
            document_id: document.id,
        })
        .await;
    Ok(document.id)
}

/// Append markdown and emit `scratchpad_updated`. Blank input is a no-op.
pub async fn append(
    ctx: &RunContext,
    node_id: Uuid,
    document_id: Uuid,
    markdown: &str,
) -> Result<(), OrchestratorError> {
    let markdown = markdown.trim();
    if markdown.is_empty() {
        return Ok(());
    }
    let document = ctx
        .store
        .get_document(document_id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "document",
            id: document_id,
        })?;
    let content = format!("{}\n\n{}\n", document.content.trim_end(), markdown);
    ctx.store
        .update_document_content(document_id, &content)
        .await?;
    ctx.events
        .emit(EventKind::ScratchpadUpdated {
            node_id,
            document_id,
            tail: tail_preview(&content),
        })
        .await;
    Ok(())
}

/// Recent scratchpad history for prompts.
pub async fn tail(ctx: &RunContext, document_id: Uuid) -> Result<String, OrchestratorError> {
    let content = ctx
        .store
        .get_document(document_id)
        .await?
        .map(|d| d.content)
        .unwrap_or_default();
    Ok(tail_chars(&content, ctx.config.scratchpad_tail_chars))
}
