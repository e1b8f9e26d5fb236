//! Offline construction of the QID to (title, image, abstract) mapping from
//! Wikidata and Wikipedia dump extracts.

use crate::WikiInfo;
use crate::data::{self, LoadError};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub type QidMap = IndexMap<String, String>;

static QID_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<http://www\.wikidata\.org/entity/(Q[0-9]+)>$").expect("valid qid url regex")
});
static TITLE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<https://en\.wikipedia\.org/wiki/(.*?)>$").expect("valid title url regex")
});
static MULTI_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").expect("valid space regex"));

#[derive(Debug, Error)]
pub enum MappingError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `<http://www.wikidata.org/entity/Q42>` becomes `Q42`. Other input is
/// returned trimmed.
pub fn qid_from_url(url: &str) -> String {
    let url = url.trim();
    match QID_URL_RE.captures(url) {
        Some(caps) => caps[1].to_string(),
        None => url.to_string(),
    }
}

/// `<https://en.wikipedia.org/wiki/Foo_%28bar%29>` becomes `Foo (bar)`.
pub fn title_from_url(url: &str) -> String {
    let url = url.trim();
    let raw = match TITLE_URL_RE.captures(url) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()).to_string(),
        None => url.to_string(),
    };
    percent_decode_str(&raw)
        .decode_utf8_lossy()
        .replace('_', " ")
}

/// Cleans an abstract literal from the DBpedia-style dump, e.g.
/// `"@ Douglas Adams was an  author. @"@en` becomes
/// `Douglas Adams was an author.`
pub fn clean_abstract(raw: &str) -> String {
    let text = raw.strip_prefix("\"@ ").unwrap_or(raw);
    let text = text.replace("\"@en", "").replace('@', "");
    let text = MULTI_SPACE_RE.replace_all(&text, " ");
    text.replace("\\\"", "\"")
        .replace('\t', " ")
        .trim()
        .to_string()
}

/// Lines that did not have the expected number of columns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Skipped(pub usize);

fn read_two_columns<F>(path: &Path, max_fields: usize, mut add: F) -> Result<Skipped, LoadError>
where
    F: FnMut(&str, &str),
{
    let mut skipped = 0;
    data::for_each_tsv_row(path, max_fields, |line, fields| {
        if fields.len() != 2 {
            skipped += 1;
            if skipped <= 5 {
                warn!(path = %path.display(), line, "Skipping malformed line");
            }
            return;
        }
        add(fields[0], fields[1]);
    })?;
    Ok(Skipped(skipped))
}

/// QID to Wikipedia title. Later lines override earlier ones.
pub fn read_titles(path: &Path) -> Result<(QidMap, Skipped), LoadError> {
    info!(path = %path.display(), "Building qid-to-title mapping");
    let mut map = QidMap::new();
    let skipped = read_two_columns(path, usize::MAX, |qid_url, wiki_url| {
        map.insert(qid_from_url(qid_url), title_from_url(wiki_url));
    })?;
    Ok((map, skipped))
}

/// QID to Wikidata image. A QID may have several image properties; only the
/// first one is kept.
pub fn read_images(path: &Path) -> Result<(QidMap, Skipped), LoadError> {
    info!(path = %path.display(), "Building qid-to-image mapping");
    let mut map = QidMap::new();
    let skipped = read_two_columns(path, usize::MAX, |qid_url, image_url| {
        map.entry(qid_from_url(qid_url))
            .or_insert_with(|| image_url.trim().trim_matches(['<', '>']).to_string());
    })?;
    Ok((map, skipped))
}

/// QID to cleaned abstract. The abstract itself may contain tabs.
pub fn read_abstracts(path: &Path) -> Result<(QidMap, Skipped), LoadError> {
    info!(path = %path.display(), "Building qid-to-abstract mapping");
    let mut map = QidMap::new();
    let skipped = read_two_columns(path, 2, |qid_url, abstract_text| {
        map.insert(qid_from_url(qid_url), clean_abstract(abstract_text));
    })?;
    Ok((map, skipped))
}

/// Plain `qid, image_url` lines as written by the thumbnail fetcher.
pub fn read_image_overrides(path: &Path) -> Result<QidMap, LoadError> {
    info!(path = %path.display(), "Reading Wikipedia image mapping");
    Ok(data::read_pairs_tsv(path)?.into_iter().collect())
}

/// Fills QIDs that are missing or empty in `preferred` from `fallback`.
pub fn combine_images(mut preferred: QidMap, fallback: QidMap) -> QidMap {
    info!("Combining image mappings");
    for (qid, image) in fallback {
        if image.is_empty() {
            continue;
        }
        match preferred.get_mut(&qid) {
            Some(existing) if existing.is_empty() => *existing = image,
            Some(_) => {}
            None => {
                preferred.insert(qid, image);
            }
        }
    }
    preferred
}

/// Three-way union of the title, image and abstract mappings. A QID present
/// in only some of them gets empty strings for the missing fields.
pub fn merge(
    titles: QidMap,
    mut images: QidMap,
    mut abstracts: QidMap,
) -> IndexMap<String, WikiInfo> {
    info!("Combining mappings to qid-to-wiki-info mapping");
    let mut merged = IndexMap::with_capacity(titles.len());
    for (qid, title) in titles {
        let image = images.shift_remove(&qid).unwrap_or_default();
        let abstract_text = abstracts.shift_remove(&qid).unwrap_or_default();
        merged.insert(qid, WikiInfo::new(title, image, abstract_text));
    }
    for (qid, image) in images {
        let abstract_text = abstracts.shift_remove(&qid).unwrap_or_default();
        merged.insert(qid, WikiInfo::new("", image, abstract_text));
    }
    for (qid, abstract_text) in abstracts {
        merged.insert(qid, WikiInfo::new("", "", abstract_text));
    }
    merged
}

#[derive(Debug, Clone)]
pub struct MappingSources {
    pub titles: PathBuf,
    pub images: PathBuf,
    pub abstracts: PathBuf,
    /// Wikipedia thumbnail mapping preferred over the Wikidata images.
    pub image_overrides: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MappingStats {
    pub titles: usize,
    pub images: usize,
    pub abstracts: usize,
    pub written: usize,
    pub skipped_lines: usize,
}

pub fn write_mapping(
    output: &Path,
    mapping: &IndexMap<String, WikiInfo>,
) -> Result<usize, MappingError> {
    info!(path = %output.display(), "Writing qid-to-wiki-info mapping");
    let write_err = |source| MappingError::Write {
        path: output.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(output).map_err(write_err)?);
    let written = data::write_info_tsv(
        &mut writer,
        mapping.iter().map(|(qid, info)| (qid.as_str(), info)),
    )
    .map_err(write_err)?;
    writer.flush().map_err(write_err)?;
    Ok(written)
}

/// Runs the three extraction passes, merges them and writes the TSV mapping.
pub fn build_info_mapping(
    sources: &MappingSources,
    output: &Path,
) -> Result<MappingStats, MappingError> {
    let (titles, (images, abstracts)) = rayon::join(
        || read_titles(&sources.titles),
        || {
            rayon::join(
                || read_images(&sources.images),
                || read_abstracts(&sources.abstracts),
            )
        },
    );
    let (titles, Skipped(skipped_titles)) = titles?;
    let (mut images, Skipped(skipped_images)) = images?;
    let (abstracts, Skipped(skipped_abstracts)) = abstracts?;
    let skipped_lines = skipped_titles + skipped_images + skipped_abstracts;
    if skipped_lines > 0 {
        warn!(skipped_lines, "Some input lines were malformed and skipped");
    }

    if let Some(path) = &sources.image_overrides {
        images = combine_images(read_image_overrides(path)?, images);
    }

    let mut stats = MappingStats {
        titles: titles.len(),
        images: images.len(),
        abstracts: abstracts.len(),
        written: 0,
        skipped_lines,
    };
    let merged = merge(titles, images, abstracts);
    stats.written = write_mapping(output, &merged)?;
    info!(
        written = stats.written,
        titles = stats.titles,
        images = stats.images,
        abstracts = stats.abstracts,
        "Mapping written"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn qid_map(pairs: &[(&str, &str)]) -> QidMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn qid_is_extracted_from_entity_url() {
        assert_eq!(qid_from_url("<http://www.wikidata.org/entity/Q42>"), "Q42");
        assert_eq!(qid_from_url("Q7"), "Q7");
    }

    #[test]
    fn title_is_decoded_from_article_url() {
        assert_eq!(
            title_from_url("<https://en.wikipedia.org/wiki/Foo_%28bar%29>"),
            "Foo (bar)"
        );
        assert_eq!(
            title_from_url("<https://en.wikipedia.org/wiki/Z%C3%BCrich>"),
            "Zürich"
        );
    }

    #[test]
    fn abstract_markup_is_cleaned() {
        assert_eq!(
            clean_abstract(r#""@ Douglas Adams was an  English author. @"@en"#),
            "Douglas Adams was an English author."
        );
        assert_eq!(
            clean_abstract("He said \\\"hi\\\"\tthen   left."),
            "He said \"hi\" then left."
        );
    }

    #[test]
    fn merge_is_a_three_way_union() {
        let merged = merge(
            qid_map(&[("Q1", "T")]),
            qid_map(&[("Q1", "I"), ("Q2", "I2")]),
            qid_map(&[("Q2", "A")]),
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["Q1"], WikiInfo::new("T", "I", ""));
        assert_eq!(merged["Q2"], WikiInfo::new("", "I2", "A"));
    }

    #[test]
    fn merge_keeps_abstract_only_entries() {
        let merged = merge(QidMap::new(), QidMap::new(), qid_map(&[("Q3", "A3")]));
        assert_eq!(merged["Q3"], WikiInfo::new("", "", "A3"));
    }

    #[test]
    fn combine_prefers_non_empty_primary_images() {
        let wikipedia = qid_map(&[("Q1", "wiki1.png"), ("Q2", "")]);
        let wikidata = qid_map(&[
            ("Q1", "data1.png"),
            ("Q2", "data2.png"),
            ("Q3", "data3.png"),
            ("Q4", ""),
        ]);
        let combined = combine_images(wikipedia, wikidata);
        assert_eq!(combined["Q1"], "wiki1.png");
        assert_eq!(combined["Q2"], "data2.png");
        assert_eq!(combined["Q3"], "data3.png");
        assert!(!combined.contains_key("Q4"));
    }

    #[test]
    fn build_writes_merged_tsv() {
        let dir = tempdir().unwrap();
        let titles = dir.path().join("titles.tsv");
        let images = dir.path().join("images.tsv");
        let abstracts = dir.path().join("abstracts.tsv");
        let output = dir.path().join("info.tsv");
        fs::write(
            &titles,
            "<http://www.wikidata.org/entity/Q1>\t<https://en.wikipedia.org/wiki/Bar_Film>\n\
             broken line without tab\n",
        )
        .unwrap();
        fs::write(
            &images,
            "<http://www.wikidata.org/entity/Q1>\t<http://img/first.jpg>\n\
             <http://www.wikidata.org/entity/Q1>\t<http://img/second.jpg>\n\
             <http://www.wikidata.org/entity/Q2>\t<http://img/q2.jpg>\n",
        )
        .unwrap();
        fs::write(
            &abstracts,
            "<http://www.wikidata.org/entity/Q2>\t\"@ A film\twith tabs. @\"@en\n",
        )
        .unwrap();

        let stats = build_info_mapping(
            &MappingSources {
                titles,
                images,
                abstracts,
                image_overrides: None,
            },
            &output,
        )
        .unwrap();
        assert_eq!(stats.written, 2);
        assert_eq!(stats.skipped_lines, 1);
        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(
            written,
            "Q1\tBar Film\thttp://img/first.jpg\t\nQ2\t\thttp://img/q2.jpg\tA film with tabs.\n"
        );
    }

    #[test]
    fn build_applies_image_overrides() {
        let dir = tempdir().unwrap();
        let titles = dir.path().join("titles.tsv");
        let images = dir.path().join("images.tsv");
        let abstracts = dir.path().join("abstracts.tsv");
        let overrides = dir.path().join("wiki_images.tsv");
        let output = dir.path().join("info.tsv");
        fs::write(
            &titles,
            "<http://www.wikidata.org/entity/Q1>\t<https://en.wikipedia.org/wiki/X>\n",
        )
        .unwrap();
        fs::write(
            &images,
            "<http://www.wikidata.org/entity/Q1>\t<http://img/wikidata.jpg>\n",
        )
        .unwrap();
        fs::write(&abstracts, "").unwrap();
        fs::write(&overrides, "Q1\thttp://img/thumb.jpg\n").unwrap();

        build_info_mapping(
            &MappingSources {
                titles,
                images,
                abstracts,
                image_overrides: Some(overrides),
            },
            &output,
        )
        .unwrap();
        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(written, "Q1\tX\thttp://img/thumb.jpg\t\n");
    }
}
