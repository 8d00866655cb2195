use aho_corasick::{AhoCorasick, BuildError, MatchKind};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template file '{path}': {source}")]
    ReadError {
        path: String,
        source: std::io::Error,
    },
    #[error("Body template '{path}' must exist and be a non-empty file")]
    Empty { path: String },
    #[error("Failed to build variable matcher: {0}")]
    Matcher(#[from] BuildError),
}

/// A loaded body template.
///
/// The text is trusted plain text: there is no placeholder syntax and no
/// escaping, variable names are matched literally.
#[derive(Debug, Clone)]
pub struct EmailTemplate {
    body_template: String,
}

impl EmailTemplate {
    /// Loads the body template from a file. Empty files are rejected.
    pub fn load(template_path: &Path) -> Result<Self, TemplateError> {
        let path_str = template_path.to_string_lossy().to_string();
        let content = fs::read_to_string(template_path).map_err(|e| TemplateError::ReadError {
            path: path_str.clone(),
            source: e,
        })?;

        if content.is_empty() {
            return Err(TemplateError::Empty { path: path_str });
        }

        log::debug!("Loaded body template from \"{}\"", path_str);
        Ok(Self::from_content(content))
    }

    pub fn from_content(body: impl Into<String>) -> Self {
        EmailTemplate {
            body_template: body.into(),
        }
    }

    /// Replaces every occurrence of each variable name with its value in a
    /// single left-to-right pass.
    ///
    /// Where several names match at the same position the earliest variable
    /// in `variables` wins. Substituted values are never scanned again.
    pub fn render(&self, variables: &[(&str, &str)]) -> Result<String, TemplateError> {
        let (names, values): (Vec<&str>, Vec<&str>) = variables
            .iter()
            .copied()
            .filter(|(name, _)| !name.is_empty())
            .unzip();

        if names.is_empty() {
            return Ok(self.body_template.clone());
        }

        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostFirst)
            .build(&names)?;

        Ok(matcher.replace_all(&self.body_template, &values))
    }
}
