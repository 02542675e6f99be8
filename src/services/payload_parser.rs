//! JSON webhook payload parser for GitHub, GitLab and Bitbucket push events.

use serde_json::Value;

use super::collaborators::{PayloadParser, WebhookHeaders};
use crate::error::SyncError;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Git host that sent a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookSource {
    GitHub,
    GitLab,
    Bitbucket,
}

impl WebhookSource {
    /// Identify the sender from its event header.
    pub fn detect(headers: &WebhookHeaders) -> Option<(Self, &str)> {
        if let Some(event) = header(headers, "x-github-event") {
            return Some((Self::GitHub, event));
        }
        if let Some(event) = header(headers, "x-gitlab-event") {
            return Some((Self::GitLab, event));
        }
        header(headers, "x-event-key").map(|event| (Self::Bitbucket, event))
    }
}

fn header<'a>(headers: &'a WebhookHeaders, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn string_at<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Parser for push payloads of the common git hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadParser;

impl JsonPayloadParser {
    /// Source of a push event; any other event kind is malformed for sync.
    fn push_source(&self, headers: &WebhookHeaders) -> Result<WebhookSource, SyncError> {
        let (source, event) = WebhookSource::detect(headers)
            .ok_or_else(|| SyncError::payload_malformed("unrecognized webhook source"))?;

        let is_push = match source {
            WebhookSource::GitHub => event == "push",
            WebhookSource::GitLab => event == "Push Hook",
            WebhookSource::Bitbucket => event == "repo:push",
        };
        if !is_push {
            return Err(SyncError::payload_malformed(format!(
                "unsupported webhook event '{}'",
                event
            )));
        }
        Ok(source)
    }
}

impl PayloadParser for JsonPayloadParser {
    fn is_ping(&self, headers: &WebhookHeaders) -> bool {
        matches!(
            WebhookSource::detect(headers),
            Some((WebhookSource::GitHub, "ping")) | Some((WebhookSource::Bitbucket, "diagnostics:ping"))
        )
    }

    fn obtain_repo(
        &self,
        payload: &Value,
        headers: &WebhookHeaders,
    ) -> Result<Option<String>, SyncError> {
        let repo = match self.push_source(headers)? {
            WebhookSource::GitHub | WebhookSource::Bitbucket => {
                string_at(payload, "/repository/full_name")
            }
            WebhookSource::GitLab => string_at(payload, "/project/path_with_namespace"),
        };
        Ok(repo.map(String::from))
    }

    fn obtain_branch(
        &self,
        payload: &Value,
        headers: &WebhookHeaders,
    ) -> Result<Option<String>, SyncError> {
        let branch = match self.push_source(headers)? {
            WebhookSource::GitHub | WebhookSource::GitLab => string_at(payload, "/ref")
                .map(|r| r.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(r)),
            WebhookSource::Bitbucket => string_at(payload, "/push/changes/0/new/name"),
        };
        Ok(branch.map(String::from))
    }

    fn obtain_commit_id(
        &self,
        payload: &Value,
        headers: &WebhookHeaders,
    ) -> Result<Option<String>, SyncError> {
        let commit = match self.push_source(headers)? {
            WebhookSource::GitHub => {
                string_at(payload, "/after").or_else(|| string_at(payload, "/head_commit/id"))
            }
            WebhookSource::GitLab => {
                string_at(payload, "/checkout_sha").or_else(|| string_at(payload, "/after"))
            }
            WebhookSource::Bitbucket => string_at(payload, "/push/changes/0/new/target/hash"),
        };
        Ok(commit.map(String::from))
    }
}
