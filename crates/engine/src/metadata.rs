//! Version-metadata operations.
//!
//! Every successful backup embeds its version-metadata document on the
//! storage (under `versions/`, through the same transform chain as block
//! data), which is what makes database-less restore possible.  The same
//! document format backs `metadata-export`/`metadata-import` on files and
//! stdout, and `metadata-backup`/`metadata-restore`/`metadata-ls` against
//! storages.

use tracing::{info, instrument};

use benji_common::VersionUid;
use benji_meta::export::{export_versions, import_document, VersionDocument};
use benji_meta::{MetaError, MetaStore};

use crate::{Engine, EngineError};

impl Engine {
    /// Write the just-finished version's metadata document to its storage.
    pub(crate) fn backup_version_metadata(&self, uid: &VersionUid) -> Result<(), EngineError> {
        let version = self.meta().version(uid)?;
        let document = export_versions(self.meta(), std::slice::from_ref(uid))?;
        let json = serde_json::to_vec(&document).expect("metadata document always serializes");
        let storage = self.storage(&version.storage)?;
        storage.save_version_metadata(uid, &json)?;
        info!(uid = %uid, storage = %version.storage, "version metadata embedded");
        Ok(())
    }

    /// Serialize versions to the schema 2.0.0 JSON document.
    pub fn metadata_export(&self, uids: &[VersionUid]) -> Result<String, EngineError> {
        let document = export_versions(self.meta(), uids)?;
        Ok(serde_json::to_string_pretty(&document).expect("metadata document always serializes"))
    }

    /// Import a schema 2.0.0 document into the metadata store.
    pub fn metadata_import(&self, json: &str) -> Result<Vec<VersionUid>, EngineError> {
        let document = parse_document(json)?;
        Ok(import_document(self.meta(), &document)?)
    }

    /// Re-embed metadata documents for every matching version on its own
    /// storage.
    #[instrument(skip(self, filter))]
    pub fn metadata_backup(&self, filter: Option<&str>) -> Result<Vec<VersionUid>, EngineError> {
        let versions = self.ls(filter)?;
        let mut written = Vec::with_capacity(versions.len());
        for version in versions {
            self.backup_version_metadata(&version.uid)?;
            written.push(version.uid);
        }
        Ok(written)
    }

    /// Version-metadata objects present on a storage.
    pub fn metadata_ls(&self, storage_name: &str) -> Result<Vec<VersionUid>, EngineError> {
        let storage = self.storage(storage_name)?;
        let mut uids = storage.list_version_metadata()?;
        uids.sort();
        Ok(uids)
    }

    /// Import selected versions from a storage's metadata objects into the
    /// database.
    pub fn metadata_restore(
        &self,
        storage_name: &str,
        uids: &[VersionUid],
    ) -> Result<Vec<VersionUid>, EngineError> {
        let storage = self.storage(storage_name)?;
        let mut imported = Vec::with_capacity(uids.len());
        for uid in uids {
            let json = storage.read_version_metadata(uid)?;
            let document = parse_document_bytes(&json)?;
            imported.extend(import_document(self.meta(), &document)?);
        }
        Ok(imported)
    }

    /// Pull one version's metadata object into a fresh in-memory store
    /// (database-less restore).
    pub(crate) fn import_version_metadata_into_memory(
        &self,
        storage_name: &str,
        uid: &VersionUid,
    ) -> Result<MetaStore, EngineError> {
        let storage = self.storage(storage_name)?;
        let json = storage.read_version_metadata(uid)?;
        let document = parse_document_bytes(&json)?;

        let store = MetaStore::open_memory()?;
        import_document(&store, &document)?;
        Ok(store)
    }
}

fn parse_document(json: &str) -> Result<VersionDocument, EngineError> {
    serde_json::from_str(json)
        .map_err(|err| MetaError::malformed(format!("metadata document: {err}")).into())
}

fn parse_document_bytes(json: &[u8]) -> Result<VersionDocument, EngineError> {
    serde_json::from_slice(json)
        .map_err(|err| MetaError::malformed(format!("metadata document: {err}")).into())
}
