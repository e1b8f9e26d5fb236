pub mod aqqu;
pub mod backend;
pub mod data;
pub mod images;
pub mod mapping;
pub mod mentions;
pub mod qac;
#[cfg(feature = "web")]
pub mod web;

pub use data::{LoadError, WikiInfo, wikipedia_url};

use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub const INFO_MAPPING_FILE: &str = "qid_to_wikipedia_info.tsv";
pub const MID_MAPPING_FILE: &str = "mid_to_qid.tsv";

/// Read-only QID and MID lookup tables.
///
/// Built once before the server starts and never written afterwards, so it is
/// shared between request handlers behind a plain `Arc`.
#[derive(Debug, Default)]
pub struct EntityIndex {
    qid_info: HashMap<String, WikiInfo>,
    mid_to_qid: HashMap<String, String>,
}

impl EntityIndex {
    /// QID keys are stored lower-cased; MIDs are kept verbatim.
    pub fn new<I, M>(qid_info: I, mid_to_qid: M) -> Self
    where
        I: IntoIterator<Item = (String, WikiInfo)>,
        M: IntoIterator<Item = (String, String)>,
    {
        Self {
            qid_info: qid_info
                .into_iter()
                .map(|(qid, info)| (qid.to_lowercase(), info))
                .collect(),
            mid_to_qid: mid_to_qid.into_iter().collect(),
        }
    }

    /// Loads both mapping files from a data directory.
    pub fn load(data_dir: &Path) -> Result<Self, LoadError> {
        Self::from_files(
            &data_dir.join(INFO_MAPPING_FILE),
            &data_dir.join(MID_MAPPING_FILE),
        )
    }

    pub fn from_files(info_path: &Path, mid_path: &Path) -> Result<Self, LoadError> {
        info!(path = %info_path.display(), "Loading QID to Wikipedia info mapping");
        let info_rows = data::read_info_tsv(info_path)?;
        info!(path = %mid_path.display(), "Loading MID to QID mapping");
        let mid_rows = data::read_pairs_tsv(mid_path)?;
        let index = Self::new(info_rows, mid_rows);
        info!(
            entities = index.len(),
            mids = index.mid_count(),
            "Entity index ready"
        );
        Ok(index)
    }

    /// Returns the stored triple, or [`WikiInfo::EMPTY`] for unknown QIDs.
    pub fn info_by_qid(&self, qid: &str) -> &WikiInfo {
        let key = qid.trim().to_lowercase();
        self.qid_info.get(&key).unwrap_or(WikiInfo::empty())
    }

    pub fn qid_for_mid(&self, mid: &str) -> Option<&str> {
        self.mid_to_qid.get(mid.trim()).map(String::as_str)
    }

    /// Unknown MIDs resolve to the empty triple regardless of the QID table.
    pub fn info_by_mid(&self, mid: &str) -> &WikiInfo {
        match self.qid_for_mid(mid) {
            Some(qid) => self.info_by_qid(qid),
            None => WikiInfo::empty(),
        }
    }

    pub fn url_for_qid(&self, qid: &str) -> Option<String> {
        self.info_by_qid(qid).url()
    }

    pub fn len(&self) -> usize {
        self.qid_info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.qid_info.is_empty()
    }

    pub fn mid_count(&self) -> usize {
        self.mid_to_qid.len()
    }
}
