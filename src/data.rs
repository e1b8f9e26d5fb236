use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const WIKIPEDIA_ARTICLE_BASE: &str = "https://en.wikipedia.org/wiki/";

/// Characters left untouched when quoting titles and questions for a URL.
pub const URL_QUOTE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

static EMPTY_INFO: WikiInfo = WikiInfo::EMPTY;

/// Wikipedia metadata cached for one Wikidata entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WikiInfo {
    pub title: String,
    pub image: String,
    pub abstract_text: String,
}

impl WikiInfo {
    /// Sentinel returned by every lookup that misses.
    pub const EMPTY: WikiInfo = WikiInfo {
        title: String::new(),
        image: String::new(),
        abstract_text: String::new(),
    };

    pub fn new(
        title: impl Into<String>,
        image: impl Into<String>,
        abstract_text: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            image: image.into(),
            abstract_text: abstract_text.into(),
        }
    }

    pub fn empty() -> &'static WikiInfo {
        &EMPTY_INFO
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.image.is_empty() && self.abstract_text.is_empty()
    }

    pub fn url(&self) -> Option<String> {
        wikipedia_url(&self.title)
    }
}

/// Builds the canonical English Wikipedia article URL for a page title.
pub fn wikipedia_url(title: &str) -> Option<String> {
    if title.is_empty() {
        return None;
    }
    let underscored = title.replace(' ', "_");
    Some(format!(
        "{WIKIPEDIA_ARTICLE_BASE}{}",
        utf8_percent_encode(&underscored, URL_QUOTE)
    ))
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("mapping file {} not found", path.display())]
    Missing { path: PathBuf },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn open_tsv(path: &Path) -> Result<BufReader<File>, LoadError> {
    if !path.exists() {
        return Err(LoadError::Missing {
            path: path.to_path_buf(),
        });
    }
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Calls `row` with the tab-separated fields of every non-blank line.
/// `max_fields` bounds the split the same way `splitn` does.
pub fn for_each_tsv_row<F>(path: &Path, max_fields: usize, mut row: F) -> Result<(), LoadError>
where
    F: FnMut(usize, Vec<&str>),
{
    let reader = open_tsv(path)?;
    for (idx, line_res) in reader.lines().enumerate() {
        let line = line_res.map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }
        row(idx + 1, line.splitn(max_fields, '\t').collect());
    }
    Ok(())
}

/// Reads a `qid, title, image, abstract` file. Missing trailing columns are empty.
pub fn read_info_tsv(path: &Path) -> Result<Vec<(String, WikiInfo)>, LoadError> {
    let mut rows = Vec::new();
    for_each_tsv_row(path, 4, |_, fields| {
        let field = |i: usize| fields.get(i).copied().unwrap_or_default();
        let qid = field(0).trim();
        if qid.is_empty() {
            return;
        }
        rows.push((qid.to_string(), WikiInfo::new(field(1), field(2), field(3))));
    })?;
    Ok(rows)
}

/// Reads a two-column `key, value` file such as `mid, qid` or `qid, image_url`.
pub fn read_pairs_tsv(path: &Path) -> Result<Vec<(String, String)>, LoadError> {
    let mut rows = Vec::new();
    for_each_tsv_row(path, 2, |_, fields| {
        let key = fields[0].trim();
        if key.is_empty() {
            return;
        }
        let value = fields.get(1).map(|v| v.trim()).unwrap_or_default();
        rows.push((key.to_string(), value.to_string()));
    })?;
    Ok(rows)
}

fn tsv_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

pub fn write_info_tsv<'a, W, I>(writer: &mut W, rows: I) -> io::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = (&'a str, &'a WikiInfo)>,
{
    let mut written = 0;
    for (qid, info) in rows {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            tsv_field(qid),
            tsv_field(&info.title),
            tsv_field(&info.image),
            tsv_field(&info.abstract_text)
        )?;
        written += 1;
    }
    Ok(written)
}

pub fn write_pair_tsv<W: Write>(writer: &mut W, key: &str, value: &str) -> io::Result<()> {
    writeln!(writer, "{}\t{}", tsv_field(key), tsv_field(value))
}
