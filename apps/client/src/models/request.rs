use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::errors::ClientError;

/// Resume extensions the generation service can parse.
pub const ACCEPTED_EXTENSIONS: [&str; 2] = [".pdf", ".docx"];

/// Label recorded in history for generations sourced from pasted job text.
pub const FREE_TEXT_SOURCE_LABEL: &str = "Job description";

/// Target language of the generated letter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Ru,
    En,
}

impl Language {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Language::Ru => "ru",
            Language::En => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for Language {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ru" => Ok(Language::Ru),
            "en" => Ok(Language::En),
            other => Err(ClientError::Validation(format!(
                "unsupported language '{other}' (expected ru or en)"
            ))),
        }
    }
}

/// Where the job description comes from. Exactly one variant is populated by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    Url(String),
    Text(String),
}

impl JobSource {
    /// Multipart field name and value for this source.
    pub fn form_field(&self) -> (&'static str, &str) {
        match self {
            JobSource::Url(url) => ("job_url", url),
            JobSource::Text(text) => ("job_text", text),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            JobSource::Url(url) => Some(url),
            JobSource::Text(_) => None,
        }
    }

    fn validate(self) -> Result<Self, ClientError> {
        match self {
            JobSource::Url(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(ClientError::Validation("job URL cannot be empty".to_string()));
                }
                let parsed = Url::parse(trimmed)
                    .map_err(|e| ClientError::Validation(format!("invalid job URL: {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                    return Err(ClientError::Validation(format!(
                        "job URL must be an http(s) address: {trimmed}"
                    )));
                }
                Ok(JobSource::Url(trimmed.to_string()))
            }
            JobSource::Text(raw) => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(ClientError::Validation(
                        "job description cannot be empty".to_string(),
                    ));
                }
                Ok(JobSource::Text(trimmed.to_string()))
            }
        }
    }
}

/// Short human-readable description of a job source: the URL's hostname, or a
/// fixed placeholder for pasted text.
pub fn source_label_for(source: &JobSource) -> String {
    match source {
        JobSource::Url(url) => label_for_url(url),
        JobSource::Text(_) => FREE_TEXT_SOURCE_LABEL.to_string(),
    }
}

pub(crate) fn label_for_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// An uploaded resume: raw bytes plus the original filename.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ResumeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeFile")
            .field("filename", &self.filename)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ResumeFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        if self.filename.to_ascii_lowercase().ends_with(".docx") {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        } else {
            "application/pdf"
        }
    }

    fn validate(self) -> Result<Self, ClientError> {
        if self.bytes.is_empty() {
            return Err(ClientError::Validation(format!(
                "resume '{}' is empty",
                self.filename
            )));
        }
        if !is_accepted_filename(&self.filename) {
            return Err(ClientError::Validation(format!(
                "resume '{}' must be a PDF or DOCX file",
                self.filename
            )));
        }
        Ok(self)
    }
}

pub fn is_accepted_filename(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ACCEPTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// A validated generation request. Construct through [`GenerationRequest::new`];
/// an invalid request never reaches the network.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    resume: ResumeFile,
    job_source: JobSource,
    language: Language,
}

impl GenerationRequest {
    pub fn new(
        resume: ResumeFile,
        job_source: JobSource,
        language: Language,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            resume: resume.validate()?,
            job_source: job_source.validate()?,
            language,
        })
    }

    pub fn resume(&self) -> &ResumeFile {
        &self.resume
    }

    pub fn job_source(&self) -> &JobSource {
        &self.job_source
    }

    pub fn language(&self) -> Language {
        self.language
    }
}

/// Body of a successful buffered generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub cover_letter: String,
}
