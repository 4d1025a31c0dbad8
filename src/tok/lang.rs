//! Language tag resolution and per-language text pipelines.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_stemmers::{Algorithm, Stemmer};
use rustc_hash::FxHashMap;
use stop_words::{get, LANGUAGE};
use unicode_segmentation::UnicodeSegmentation;

/// Language used for untagged and unknown values.
pub const DEFAULT_LANG: &str = "en";

/// Lowercased primary subtag of `tag`, whether or not it is supported.
pub fn base(tag: &str) -> String {
    tag.split(|c| c == '-' || c == '_')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Resolves a language tag to a supported base language.
///
/// Regional variants resolve to their parent (`es-419` and `es-ES` become
/// `es`); unsupported or empty tags resolve to [`DEFAULT_LANG`].
pub fn resolve(tag: &str) -> &'static str {
    match base(tag).as_str() {
        "en" => "en",
        "es" => "es",
        "fr" => "fr",
        "de" => "de",
        "it" => "it",
        "pt" => "pt",
        "nl" => "nl",
        "ru" => "ru",
        "sv" => "sv",
        "no" | "nb" | "nn" => "no",
        "da" => "da",
        "fi" => "fi",
        "hu" => "hu",
        "ro" => "ro",
        "tr" => "tr",
        _ => DEFAULT_LANG,
    }
}

fn algorithm(lang: &str) -> (Algorithm, LANGUAGE) {
    match lang {
        "es" => (Algorithm::Spanish, LANGUAGE::Spanish),
        "fr" => (Algorithm::French, LANGUAGE::French),
        "de" => (Algorithm::German, LANGUAGE::German),
        "it" => (Algorithm::Italian, LANGUAGE::Italian),
        "pt" => (Algorithm::Portuguese, LANGUAGE::Portuguese),
        "nl" => (Algorithm::Dutch, LANGUAGE::Dutch),
        "ru" => (Algorithm::Russian, LANGUAGE::Russian),
        "sv" => (Algorithm::Swedish, LANGUAGE::Swedish),
        "no" => (Algorithm::Norwegian, LANGUAGE::Norwegian),
        "da" => (Algorithm::Danish, LANGUAGE::Danish),
        "fi" => (Algorithm::Finnish, LANGUAGE::Finnish),
        "hu" => (Algorithm::Hungarian, LANGUAGE::Hungarian),
        "ro" => (Algorithm::Romanian, LANGUAGE::Romanian),
        "tr" => (Algorithm::Turkish, LANGUAGE::Turkish),
        _ => (Algorithm::English, LANGUAGE::English),
    }
}

/// Lowercases, drops stop words and stems text for one language.
pub struct TextPipeline {
    stemmer: Stemmer,
    stopwords: HashSet<String>,
}

impl TextPipeline {
    fn new(lang: &str) -> Self {
        let (algo, stop_lang) = algorithm(lang);
        let stopwords = get(stop_lang)
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            stemmer: Stemmer::create(algo),
            stopwords,
        }
    }

    /// Stemmed, stop-word free terms of `text`.
    pub fn terms(&self, text: &str) -> Vec<String> {
        text.unicode_words()
            .map(str::to_lowercase)
            .filter(|word| !self.stopwords.contains(word))
            .map(|word| self.stemmer.stem(&word).into_owned())
            .collect()
    }
}

/// Lazily built pipelines keyed by resolved language.
#[derive(Default)]
pub struct PipelineCache {
    pipelines: RwLock<FxHashMap<&'static str, Arc<TextPipeline>>>,
}

impl PipelineCache {
    /// Pipeline for the language `tag` resolves to.
    pub fn for_tag(&self, tag: &str) -> Arc<TextPipeline> {
        let lang = resolve(tag);
        if let Some(pipeline) = self.pipelines.read().get(lang) {
            return Arc::clone(pipeline);
        }
        let mut pipelines = self.pipelines.write();
        Arc::clone(
            pipelines
                .entry(lang)
                .or_insert_with(|| Arc::new(TextPipeline::new(lang))),
        )
    }
}

/// Lowercased words of `text` without stemming.
pub fn plain_terms(text: &str) -> Vec<String> {
    text.unicode_words().map(str::to_lowercase).collect()
}
