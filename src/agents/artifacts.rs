//! Artifact persistence and result envelopes.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::context::RunContext;
use super::types::OrchestratorError;
use crate::events::{EventKind, HintMode};
use crate::store::{Artifact, ArtifactKind, NewArtifact, Node, ResultEnvelope, SuccessAssessment};

/// A validated artifact as declared by an executor or aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDraft {
    pub kind: ArtifactKind,
    pub label: String,
    pub title: Option<String>,
    pub document_markdown: Option<String>,
    pub json_payload: Option<Value>,
    pub is_primary: bool,
}

/// A validated node result, before its artifacts exist.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultDraft {
    pub kind: ArtifactKind,
    pub summary: String,
    pub success_assessment: SuccessAssessment,
    pub artifacts: Vec<ArtifactDraft>,
    pub primary_artifact_label: Option<String>,
    pub json_payload: Option<Value>,
}

/// How the executor wants its parent to read its output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentHintDraft {
    pub mode: HintMode,
    #[serde(default)]
    pub artifact_labels: Vec<String>,
}

/// Artifacts persisted for one node, with the label -> id ledger.
#[derive(Debug, Default)]
pub struct PersistedArtifacts {
    pub artifacts: Vec<Artifact>,
    by_label: HashMap<String, Uuid>,
}

impl PersistedArtifacts {
    pub fn id_for(&self, label: &str) -> Option<Uuid> {
        self.by_label.get(label).copied()
    }

    /// Resolve labels to ids, skipping labels that were never persisted.
    pub fn ids_for(&self, labels: &[String]) -> Vec<Uuid> {
        labels
            .iter()
            .filter_map(|label| {
                let id = self.id_for(label);
                if id.is_none() {
                    tracing::warn!(label = %label, "Unknown artifact label ignored");
                }
                id
            })
            .collect()
    }

    /// Explicit label first, then the artifact flagged primary.
    pub fn primary_id(&self, label: Option<&str>) -> Option<Uuid> {
        label
            .and_then(|l| self.id_for(l))
            .or_else(|| self.artifacts.iter().find(|a| a.is_primary).map(|a| a.id))
    }
}

/// Persist `drafts` for `node`; document artifacts get a document in the workspace.
pub async fn persist(
    ctx: &RunContext,
    node: &Node,
    drafts: &[ArtifactDraft],
) -> Result<PersistedArtifacts, OrchestratorError> {
    let mut persisted = PersistedArtifacts::default();
    for draft in drafts {
        let (document_id, payload) = match draft.kind {
            ArtifactKind::Document => {
                let title = draft.title.as_deref().unwrap_or(&draft.label);
                let markdown = draft.document_markdown.as_deref().unwrap_or_default();
                let document = ctx
                    .store
                    .create_document(ctx.workspace_id, title, markdown)
                    .await?;
                (Some(document.id), None)
            }
            _ => {
                let payload = draft
                    .json_payload
                    .clone()
                    .or_else(|| draft.document_markdown.clone().map(Value::String))
                    .unwrap_or(Value::Null);
                (None, Some(payload))
            }
        };

        let artifact = ctx
            .store
            .insert_artifact(NewArtifact {
                run_id: ctx.run_id(),
                node_id: node.id,
                kind: draft.kind,
                label: draft.label.clone(),
                title: draft.title.clone(),
                document_id,
                payload,
                is_primary: draft.is_primary,
            })
            .await?;

        ctx.events
            .emit(EventKind::ArtifactCreated {
                node_id: node.id,
                artifact_id: artifact.id,
                kind: artifact.kind,
                label: artifact.label.clone(),
                document_id: artifact.document_id,
                is_primary: artifact.is_primary,
            })
            .await;

        persisted.by_label.insert(artifact.label.clone(), artifact.id);
        persisted.artifacts.push(artifact);
    }
    Ok(persisted)
}

/// Build the envelope a parent consumes.
///
/// `document_ids` only ever lists document-kind artifacts.
pub fn build_envelope(
    draft: &ResultDraft,
    persisted: &PersistedArtifacts,
    scratchpad_doc_id: Option<Uuid>,
    scratchpad_tail: String,
) -> ResultEnvelope {
    ResultEnvelope {
        kind: draft.kind,
        summary: draft.summary.clone(),
        success_assessment: draft.success_assessment.clone(),
        primary_artifact_id: persisted.primary_id(draft.primary_artifact_label.as_deref()),
        artifact_ids: persisted.artifacts.iter().map(|a| a.id).collect(),
        document_ids: persisted
            .artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Document)
            .filter_map(|a| a.document_id)
            .collect(),
        json_payload: draft.json_payload.clone(),
        scratchpad_doc_id,
        scratchpad_tail,
    }
}

/// Resolve the parent hint: the executor's choice when it names known labels,
/// otherwise documents when there are any and JSON when there are not.
pub fn parent_hint(
    hint: Option<&ParentHintDraft>,
    envelope: &ResultEnvelope,
    persisted: &PersistedArtifacts,
) -> (HintMode, Vec<Uuid>) {
    if let Some(hint) = hint {
        let ids = persisted.ids_for(&hint.artifact_labels);
        if !ids.is_empty() || hint.artifact_labels.is_empty() {
            return (hint.mode, ids);
        }
    }
    if envelope.document_ids.is_empty() {
        (HintMode::ReadJson, envelope.artifact_ids.clone())
    } else {
        let ids = persisted
            .artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Document)
            .map(|a| a.id)
            .collect();
        (HintMode::ReadDocuments, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn artifact(kind: ArtifactKind, label: &str, is_primary: bool) -> Artifact {
        Artifact {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            kind,
            label: label.to_string(),
            title: None,
            document_id: (kind == ArtifactKind::Document).then(Uuid::new_v4),
            payload: None,
            is_primary,
            created_at: Utc::now(),
        }
    }

    fn ledger(artifacts: Vec<Artifact>) -> PersistedArtifacts {
        let by_label = artifacts.iter().map(|a| (a.label.clone(), a.id)).collect();
        PersistedArtifacts {
            artifacts,
            by_label,
        }
    }

    fn draft(primary: Option<&str>) -> ResultDraft {
        ResultDraft {
            kind: ArtifactKind::Document,
            summary: "done".to_string(),
            success_assessment: SuccessAssessment {
                met: true,
                notes: String::new(),
            },
            artifacts: vec![],
            primary_artifact_label: primary.map(str::to_string),
            json_payload: None,
        }
    }

    #[test]
    fn test_document_ids_only_for_document_artifacts() {
        let persisted = ledger(vec![
            artifact(ArtifactKind::Document, "report", false),
            artifact(ArtifactKind::Json, "data", true),
        ]);
        let envelope = build_envelope(&draft(Some("report")), &persisted, None, String::new());
        assert_eq!(envelope.artifact_ids.len(), 2);
        assert_eq!(envelope.document_ids, vec![persisted.artifacts[0].document_id.unwrap()]);
        assert_eq!(envelope.primary_artifact_id, Some(persisted.artifacts[0].id));
    }

    #[test]
    fn test_primary_falls_back_to_flag() {
        let persisted = ledger(vec![
            artifact(ArtifactKind::Summary, "a", false),
            artifact(ArtifactKind::Json, "b", true),
        ]);
        let envelope = build_envelope(&draft(Some("missing")), &persisted, None, String::new());
        assert_eq!(envelope.primary_artifact_id, Some(persisted.artifacts[1].id));
    }

    #[test]
    fn test_parent_hint_defaults() {
        let docs = ledger(vec![
            artifact(ArtifactKind::Document, "report", false),
            artifact(ArtifactKind::Json, "data", false),
        ]);
        let envelope = build_envelope(&draft(None), &docs, None, String::new());
        let (mode, ids) = parent_hint(None, &envelope, &docs);
        assert_eq!(mode, HintMode::ReadDocuments);
        assert_eq!(ids, vec![docs.artifacts[0].id]);

        let json_only = ledger(vec![artifact(ArtifactKind::Json, "data", false)]);
        let envelope = build_envelope(&draft(None), &json_only, None, String::new());
        let (mode, _) = parent_hint(None, &envelope, &json_only);
        assert_eq!(mode, HintMode::ReadJson);
    }

    #[test]
    fn test_parent_hint_translates_labels() {
        let persisted = ledger(vec![
            artifact(ArtifactKind::Document, "report", false),
            artifact(ArtifactKind::Json, "data", false),
        ]);
        let envelope = build_envelope(&draft(None), &persisted, None, String::new());
        let hint = ParentHintDraft {
            mode: HintMode::ReadJson,
            artifact_labels: vec!["data".to_string()],
        };
        let (mode, ids) = parent_hint(Some(&hint), &envelope, &persisted);
        assert_eq!(mode, HintMode::ReadJson);
        assert_eq!(ids, vec![persisted.artifacts[1].id]);
    }
}
