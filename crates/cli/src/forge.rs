// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Forge client interface: the REST surface the dispatcher and arbiter
//! need from the issue tracker. [`http::HttpForge`] is the production
//! implementation; tests use the in-memory fake from `test_support`.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Classify, ErrorKind};

/// An issue as seen by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    /// `open` or `closed`.
    pub state: String,
}

impl Issue {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// A comment on an issue. Comment ids are monotone per forge, so "newer
/// than" reduces to an id comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("rate limited")]
    RateLimited {
        /// Epoch ms, when the forge told us.
        reset_at: Option<u64>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected")]
    Auth,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forge api error: {0}")]
    Api(String),
}

impl Classify for ForgeError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Network(_) => ErrorKind::Network,
            Self::Auth => ErrorKind::Auth,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Api(_) => ErrorKind::Other,
        }
    }
}

/// The forge operations the engine depends on.
#[async_trait]
pub trait Forge: Send + Sync {
    async fn list_issues(&self, state: &str, labels: &[String]) -> Result<Vec<Issue>, ForgeError>;
    async fn get_issue(&self, id: u64) -> Result<Issue, ForgeError>;
    async fn list_comments(&self, id: u64) -> Result<Vec<Comment>, ForgeError>;
    async fn add_comment(&self, id: u64, body: &str) -> Result<(), ForgeError>;
    async fn add_labels(&self, id: u64, labels: &[String]) -> Result<(), ForgeError>;
    async fn remove_labels(&self, id: u64, labels: &[String]) -> Result<(), ForgeError>;
}
