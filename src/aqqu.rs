//! Reply model of the Aqqu answer-ranking API and the display strings built
//! from it.

use crate::EntityIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct AqquResponse {
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub parsed_query: ParsedQuery,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub entity_matches: Vec<EntityMatch>,
    #[serde(default)]
    pub relation_matches: Vec<RelationMatch>,
    #[serde(default)]
    pub answers: Vec<AnswerEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityMatch {
    pub mid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationMatch {
    #[serde(default)]
    pub relations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerEntity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParsedQuery {
    #[serde(default)]
    pub identified_entities: Vec<IdentifiedEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentifiedEntity {
    pub entity: EntityRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityRef {
    pub mid: String,
    #[serde(default)]
    pub name: String,
}

/// One answer entity as sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub name: String,
    pub url: String,
    pub image: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub mid: String,
}

/// Names of the entities Aqqu identified in the question, keyed by MID.
pub fn mid_to_name(response: &AqquResponse) -> HashMap<String, String> {
    response
        .parsed_query
        .identified_entities
        .iter()
        .map(|ident| (ident.entity.mid.clone(), ident.entity.name.clone()))
        .collect()
}

/// `film.film_character.portrayed_in_films` becomes `portrayed in films`.
pub fn relation_label(relation: &str) -> String {
    let short = match relation.rfind('.') {
        Some(pos) => &relation[pos + 1..],
        None => relation,
    };
    short.replace('_', " ")
}

pub fn interpretation_string(
    candidate: &Candidate,
    mid_to_name: &HashMap<String, String>,
) -> String {
    let entities = candidate
        .entity_matches
        .iter()
        .map(|m| {
            mid_to_name
                .get(&m.mid)
                .map(String::as_str)
                .unwrap_or(m.mid.as_str())
        })
        .collect::<Vec<_>>()
        .join(" - ");
    let relations = candidate
        .relation_matches
        .iter()
        .map(|group| {
            group
                .relations
                .iter()
                .map(|rel| relation_label(rel))
                .collect::<Vec<_>>()
                .join(" -> ")
        })
        .collect::<Vec<_>>()
        .join(" - ");
    format!("{entities}, {relations}:")
}

pub fn interpretation_strings(response: &AqquResponse) -> Vec<String> {
    let names = mid_to_name(response);
    response
        .candidates
        .iter()
        .map(|candidate| interpretation_string(candidate, &names))
        .collect()
}

pub fn answer_payload(answer: &AnswerEntity, index: &EntityIndex) -> AnswerPayload {
    let mid = answer.mid.clone().unwrap_or_default();
    let info = if mid.is_empty() {
        crate::WikiInfo::empty()
    } else {
        index.info_by_mid(&mid)
    };
    AnswerPayload {
        name: answer.name.clone(),
        url: info.url().unwrap_or_default(),
        image: info.image.clone(),
        abstract_text: info.abstract_text.clone(),
        mid,
    }
}

/// Answer entities of every candidate, enriched with Wikipedia metadata.
pub fn answer_lists(response: &AqquResponse, index: &EntityIndex) -> Vec<Vec<AnswerPayload>> {
    response
        .candidates
        .iter()
        .map(|candidate| {
            candidate
                .answers
                .iter()
                .map(|answer| answer_payload(answer, index))
                .collect()
        })
        .collect()
}
