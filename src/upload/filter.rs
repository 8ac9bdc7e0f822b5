//! Per-file inclusion decisions.
//!
//! A [`FileFilter`] runs once per file part before any of its bytes are
//! stored.  `Ok(true)` includes the file, `Ok(false)` silently skips it and
//! `Err` fails the whole upload.  A filter error that is an
//! [`UploadError`] keeps its own code; anything else is reported as a
//! rejection.

use std::future::Future;
use std::pin::Pin;

use crate::errors::{LimitCode, UploadError};
use crate::upload::{FileInfo, RequestContext};

/// Async file inclusion contract.
pub trait FileFilter: Send + Sync + 'static {
    fn decide<'a>(
        &'a self,
        ctx: &'a RequestContext,
        file: &'a FileInfo,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + 'a>>;
}

/// Includes every file.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl FileFilter for AcceptAll {
    fn decide<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        _file: &'a FileInfo,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + 'a>> {
        Box::pin(async { Ok(true) })
    }
}

/// Configuration-driven filter.
///
/// Empty lists place no restriction.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    /// Field names allowed to carry files; any other field is an error.
    allowed_fields: Vec<String>,
    /// Accepted content types (`type/subtype` or `type/*`); other files
    /// are skipped.
    allowed_types: Vec<mime::Mime>,
}

impl RuleFilter {
    pub fn new(allowed_fields: Vec<String>, allowed_types: &[String]) -> anyhow::Result<Self> {
        let allowed_types = allowed_types
            .iter()
            .map(|t| {
                t.parse::<mime::Mime>()
                    .map_err(|e| anyhow::anyhow!("invalid allowed content type '{t}': {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            allowed_fields,
            allowed_types,
        })
    }

    fn type_allowed(&self, content_type: &str) -> bool {
        if self.allowed_types.is_empty() {
            return true;
        }
        let Ok(actual) = content_type.parse::<mime::Mime>() else {
            return false;
        };
        self.allowed_types.iter().any(|allowed| {
            allowed.type_() == actual.type_()
                && (allowed.subtype() == mime::STAR || allowed.subtype() == actual.subtype())
        })
    }
}

impl FileFilter for RuleFilter {
    fn decide<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        file: &'a FileInfo,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            if !self.allowed_fields.is_empty()
                && !self.allowed_fields.iter().any(|f| *f == file.field_name)
            {
                return Err(UploadError::limit_for(
                    LimitCode::UnexpectedFile,
                    file.field_name.clone(),
                )
                .into());
            }
            Ok(self.type_allowed(&file.content_type))
        })
    }
}
