//! The purge/minify pipeline.
//!
//! Two pure operations behind a trait so the cache can be instrumented in
//! tests: `purge` removes selectors unused by a set of template files,
//! `minify` compacts the result. Pruning is AST-based via lightningcss.

use std::collections::HashSet;
use std::path::PathBuf;

use lightningcss::rules::CssRule;
use lightningcss::selector::Component;
use lightningcss::stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet};
use lightningcss::targets::Browsers;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read template '{path}': {source}")]
    Template {
        path: String,
        source: std::io::Error,
    },

    #[error("CSS parse error: {0}")]
    Parse(String),

    #[error("CSS minify error: {0}")]
    Minify(String),

    #[error("CSS print error: {0}")]
    Print(String),
}

/// The selector-removal and minification seam.
pub trait CssPipeline: Send + Sync + 'static {
    /// Remove selectors unused by the given template files.
    fn purge(&self, css: &str, templates: &[PathBuf]) -> Result<String, PipelineError>;

    /// Minify a stylesheet.
    fn minify(&self, css: &str) -> Result<String, PipelineError>;
}

/// Default pipeline backed by lightningcss.
#[derive(Debug)]
pub struct LightningPipeline {
    token: Regex,
}

impl LightningPipeline {
    pub fn new() -> Self {
        Self {
            // Candidate class tokens in template markup.
            token: Regex::new(r"[A-Za-z0-9_-]+").expect("valid token regex"),
        }
    }

    /// Collect every candidate token appearing in the template files.
    fn used_tokens(&self, templates: &[PathBuf]) -> Result<HashSet<String>, PipelineError> {
        let mut tokens = HashSet::new();
        for path in templates {
            let markup =
                std::fs::read_to_string(path).map_err(|source| PipelineError::Template {
                    path: path.display().to_string(),
                    source,
                })?;
            for token in self.token.find_iter(&markup) {
                tokens.insert(token.as_str().to_string());
            }
        }
        Ok(tokens)
    }
}

impl Default for LightningPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CssPipeline for LightningPipeline {
    fn purge(&self, css: &str, templates: &[PathBuf]) -> Result<String, PipelineError> {
        let tokens = self.used_tokens(templates)?;
        let used_set: HashSet<&str> = tokens.iter().map(|s| s.as_str()).collect();

        let mut stylesheet = StyleSheet::parse(css, ParserOptions::default())
            .map_err(|e| PipelineError::Parse(format!("{e:?}")))?;

        prune_rules(&mut stylesheet.rules.0, &used_set);

        let result = stylesheet
            .to_css(PrinterOptions::default())
            .map_err(|e| PipelineError::Print(format!("{e:?}")))?;
        Ok(result.code)
    }

    fn minify(&self, css: &str) -> Result<String, PipelineError> {
        let mut stylesheet = StyleSheet::parse(css, ParserOptions::default())
            .map_err(|e| PipelineError::Parse(format!("{e:?}")))?;

        stylesheet
            .minify(MinifyOptions {
                targets: Browsers::default().into(),
                ..Default::default()
            })
            .map_err(|e| PipelineError::Minify(format!("{e:?}")))?;

        let result = stylesheet
            .to_css(PrinterOptions {
                minify: true,
                ..Default::default()
            })
            .map_err(|e| PipelineError::Print(format!("{e:?}")))?;
        Ok(result.code)
    }
}

/// Recursively prune style rules whose every selector is known unused.
fn prune_rules(rules: &mut Vec<CssRule>, used_set: &HashSet<&str>) {
    rules.retain_mut(|rule| match rule {
        CssRule::Style(style_rule) => {
            style_rule
                .selectors
                .0
                .retain(|selector| is_selector_used(selector, used_set));
            !style_rule.selectors.0.is_empty()
        }
        CssRule::Media(media_rule) => {
            prune_rules(&mut media_rule.rules.0, used_set);
            !media_rule.rules.0.is_empty()
        }
        CssRule::Supports(supports_rule) => {
            prune_rules(&mut supports_rule.rules.0, used_set);
            !supports_rule.rules.0.is_empty()
        }
        // Keyframes, font-face and the rest are kept unconditionally.
        _ => true,
    });
}

/// Conservative keep-policy: a selector with no classes is always kept; a
/// selector with classes is kept if any of them is used.
fn is_selector_used(selector: &lightningcss::selector::Selector, used_set: &HashSet<&str>) -> bool {
    let mut has_classes = false;
    let mut any_used = false;

    for component in selector.iter() {
        if let Component::Class(ident) = component {
            has_classes = true;
            if used_set.contains(ident.as_ref()) {
                any_used = true;
            }
        }
    }

    if !has_classes {
        return true;
    }
    any_used
}
