//! Artifact registry.
//!
//! Artifacts are content-addressed: the manifest records the SHA-256 of the
//! bytes, provenance, and an opaque pointer into the blob provider. Within
//! one project a content hash maps to at most one manifest — a repeat report
//! of the same bytes returns the original manifest id with
//! `deduplicated: true` and emits no event. The dedup scope is deliberately
//! per-project, not per-tenant, so projects sharing a deployment cannot
//! probe each other's artifact existence through hash lookups.

mod blob;


pub use blob::{BlobError, BlobStore, InMemoryBlobStore, StoragePointer};

use std::collections::BTreeMap;

use base64::Engine as _;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::{Identity, Role};
use crate::core::Core;
use crate::error::CoreError;
use crate::events::{EventType, Scope, payloads};
use crate::ids;

/// How [`ArtifactReport::content`] is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactEncoding {
    /// The content string is the payload itself.
    Utf8,
    /// The content string is standard base64.
    Base64,
}

/// A typed link between artifacts (e.g. a rendering of a source document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLink {
    /// Relationship name.
    pub rel: String,
    /// The linked artifact.
    pub artifact_id: String,
}

/// Where an artifact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// The producing command, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    /// The producing run, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// The `ArtifactProduced` event that registered the manifest.
    pub event_id: String,
}

/// An immutable artifact manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Artifact identifier.
    pub artifact_id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Project scope.
    pub project_id: String,
    /// Lowercase 64-hex SHA-256 of the content bytes.
    pub content_sha256: String,
    /// Media type of the content.
    pub media_type: String,
    /// Caller-facing name (e.g. `digest.md`).
    pub logical_name: String,
    /// Content size in bytes.
    pub byte_size: u64,
    /// Free-form labels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Registration timestamp (ms).
    pub created_at: i64,
    /// Where the artifact came from.
    pub provenance: Provenance,
    /// Opaque pointer into the blob provider.
    pub storage_pointer: StoragePointer,
    /// Typed links to other artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<ArtifactLink>>,
}

/// Parameters for [`Core::report_artifact`].
#[derive(Debug, Clone)]
pub struct ArtifactReport {
    /// The content, encoded per `encoding`.
    pub content: String,
    /// How `content` is encoded.
    pub encoding: ArtifactEncoding,
    /// Media type of the decoded bytes.
    pub media_type: String,
    /// Caller-facing name.
    pub logical_name: String,
    /// Free-form labels.
    pub labels: Option<BTreeMap<String, String>>,
    /// Producing command.
    pub command_id: Option<String>,
    /// Producing run.
    pub run_id: Option<String>,
    /// Chain identity; defaults to `command_id`, then the artifact id.
    pub correlation_id: Option<String>,
    /// Typed links to other artifacts.
    pub links: Option<Vec<ArtifactLink>>,
}

/// The result of an artifact report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reported {
    /// The (new or pre-existing) manifest id.
    pub artifact_id: String,
    /// `true` when the content hash matched an existing manifest.
    pub deduplicated: bool,
}

const SELECT_ARTIFACT: &str = "SELECT artifact_id, tenant_id, project_id, content_sha256, \
     media_type, logical_name, byte_size, labels, created_at, command_id, run_id, event_id, \
     storage_pointer, links FROM artifacts";

pub(crate) fn row_to_manifest(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactManifest> {
    let labels: Option<String> = row.get(7)?;
    let pointer: String = row.get(12)?;
    let links: Option<String> = row.get(13)?;
    let json_err = |idx: usize, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(ArtifactManifest {
        artifact_id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        content_sha256: row.get(3)?,
        media_type: row.get(4)?,
        logical_name: row.get(5)?,
        byte_size: row.get::<_, i64>(6)?.try_into().unwrap_or(0),
        labels: labels
            .map(|l| serde_json::from_str(&l))
            .transpose()
            .map_err(|e| json_err(7, e))?,
        created_at: row.get(8)?,
        provenance: Provenance {
            command_id: row.get(9)?,
            run_id: row.get(10)?,
            event_id: row.get(11)?,
        },
        storage_pointer: serde_json::from_str(&pointer).map_err(|e| json_err(12, e))?,
        links: links
            .map(|l| serde_json::from_str(&l))
            .transpose()
            .map_err(|e| json_err(13, e))?,
    })
}

/// Loads a manifest within its scope. Cross-project ids come back as `None`.
pub(crate) fn load(
    conn: &Connection,
    scope: &Scope,
    artifact_id: &str,
) -> Result<Option<ArtifactManifest>, CoreError> {
    let sql =
        format!("{SELECT_ARTIFACT} WHERE artifact_id = ?1 AND tenant_id = ?2 AND project_id = ?3");
    let manifest = conn
        .prepare(&sql)?
        .query_row(
            params![artifact_id, scope.tenant_id, scope.project_id],
            row_to_manifest,
        )
        .optional()?;
    Ok(manifest)
}

fn find_by_hash(
    conn: &Connection,
    scope: &Scope,
    content_sha256: &str,
) -> Result<Option<ArtifactManifest>, CoreError> {
    let sql = format!(
        "{SELECT_ARTIFACT} WHERE project_id = ?1 AND tenant_id = ?2 AND content_sha256 = ?3"
    );
    let manifest = conn
        .prepare(&sql)?
        .query_row(
            params![scope.project_id, scope.tenant_id, content_sha256],
            row_to_manifest,
        )
        .optional()?;
    Ok(manifest)
}

impl Core {
    /// Registers an artifact. Roles: bot, owner.
    ///
    /// Decodes the content, hashes it, and — when the hash is new to the
    /// project — stores the bytes in the blob provider and appends
    /// `ArtifactProduced` (the projector inserts the manifest). A repeat of
    /// known bytes returns the original id with `deduplicated: true` and
    /// touches neither the log nor the provider.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidEncoding`] when base64 decoding fails.
    /// - Blob provider and ledger errors.
    pub fn report_artifact(
        &self,
        ident: &Identity,
        project_id: &str,
        report: ArtifactReport,
    ) -> Result<Reported, CoreError> {
        let ctx = self.guard(ident, project_id, &[Role::Bot, Role::Owner])?;
        let scope = ctx.scope();

        let bytes = match report.encoding {
            ArtifactEncoding::Utf8 => report.content.clone().into_bytes(),
            ArtifactEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(report.content.as_bytes())
                .map_err(|e| CoreError::InvalidEncoding {
                    detail: e.to_string(),
                })?,
        };
        let content_sha256 = hex::encode(Sha256::digest(&bytes));

        if let Some(existing) = self
            .store()
            .with_conn(|conn| find_by_hash(conn, &scope, &content_sha256))?
        {
            tracing::debug!(
                artifact_id = %existing.artifact_id,
                sha = %content_sha256,
                "artifact deduplicated"
            );
            return Ok(Reported {
                artifact_id: existing.artifact_id,
                deduplicated: true,
            });
        }

        // Blob write happens outside the transaction to keep it short. A
        // concurrent identical report can double-write the blob; content
        // addressing makes that benign and the manifest insert collapses it.
        let storage_pointer = self.blobs().put(&scope, &content_sha256, &bytes)?;

        let artifact_id = ids::artifact_id();
        let correlation = report
            .correlation_id
            .clone()
            .or_else(|| report.command_id.clone())
            .unwrap_or_else(|| artifact_id.clone());

        self.store().with_tx(|tx| {
            // Re-check under the transaction: a racing report may have won.
            if let Some(existing) = find_by_hash(tx, &scope, &content_sha256)? {
                return Ok(Reported {
                    artifact_id: existing.artifact_id,
                    deduplicated: true,
                });
            }

            let mut event = self.event(
                &scope,
                EventType::ArtifactProduced,
                correlation.clone(),
                serde_json::Value::Null,
            );
            let manifest = ArtifactManifest {
                artifact_id: artifact_id.clone(),
                tenant_id: scope.tenant_id.clone(),
                project_id: scope.project_id.clone(),
                content_sha256: content_sha256.clone(),
                media_type: report.media_type.clone(),
                logical_name: report.logical_name.clone(),
                byte_size: bytes.len() as u64,
                labels: report.labels.clone(),
                created_at: event.ts,
                provenance: Provenance {
                    command_id: report.command_id.clone(),
                    run_id: report.run_id.clone(),
                    event_id: event.event_id.clone(),
                },
                storage_pointer: storage_pointer.clone(),
                links: report.links.clone(),
            };
            event.payload = serde_json::to_value(payloads::ArtifactProduced {
                manifest: manifest.clone(),
            })?;
            if let Some(command_id) = &report.command_id {
                event = event.with_command(command_id);
            }
            if let Some(run_id) = &report.run_id {
                event = event.with_run(run_id);
            }
            self.append_live(tx, &event)?;

            tracing::info!(%artifact_id, sha = %content_sha256, "artifact registered");
            Ok(Reported {
                artifact_id: artifact_id.clone(),
                deduplicated: false,
            })
        })
    }

    /// Looks up a manifest. Any role.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown or cross-project ids.
    pub fn get_artifact(
        &self,
        ident: &Identity,
        project_id: &str,
        artifact_id: &str,
    ) -> Result<ArtifactManifest, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        self.store()
            .with_conn(|conn| load(conn, &ctx.scope(), artifact_id))?
            .ok_or_else(|| CoreError::not_found("artifact", artifact_id))
    }

    /// Lists the manifests a run produced, oldest first. Any role.
    ///
    /// # Errors
    ///
    /// Returns an error when the caller is not a member or the query fails.
    pub fn artifacts_for_run(
        &self,
        ident: &Identity,
        project_id: &str,
        run_id: &str,
    ) -> Result<Vec<ArtifactManifest>, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        let scope = ctx.scope();
        self.store().with_conn(|conn| {
            let sql = format!(
                "{SELECT_ARTIFACT} WHERE run_id = ?1 AND tenant_id = ?2 AND project_id = ?3 \
                 ORDER BY artifact_id ASC"
            );
            let manifests = conn
                .prepare(&sql)?
                .query_map(
                    params![run_id, scope.tenant_id, scope.project_id],
                    row_to_manifest,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(manifests)
        })
    }

    /// Lists the manifests a command produced, oldest first. Any role.
    ///
    /// # Errors
    ///
    /// Returns an error when the caller is not a member or the query fails.
    pub fn artifacts_for_command(
        &self,
        ident: &Identity,
        project_id: &str,
        command_id: &str,
    ) -> Result<Vec<ArtifactManifest>, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        let scope = ctx.scope();
        self.store().with_conn(|conn| {
            let sql = format!(
                "{SELECT_ARTIFACT} WHERE command_id = ?1 AND tenant_id = ?2 AND project_id = ?3 \
                 ORDER BY artifact_id ASC"
            );
            let manifests = conn
                .prepare(&sql)?
                .query_map(
                    params![command_id, scope.tenant_id, scope.project_id],
                    row_to_manifest,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(manifests)
        })
    }
}
