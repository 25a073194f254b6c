use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use issuebot_session::{
    CommandContext, CreatedIssue, Credential, CredentialSecret, IssueRequest, IssueTracker,
    TrackerError, TrackerIdentity,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

const ERROR_BODY_MAX_CHARS: usize = 800;

const VIEWER_QUERY: &str = "query { viewer { login name } }";
const OWNER_QUERY: &str = "query($login: String!) { repositoryOwner(login: $login) { login } }";
const REPOSITORY_ID_QUERY: &str =
    "query($owner: String!, $name: String!) { repository(owner: $owner, name: $name) { id } }";
const CREATE_ISSUE_MUTATION: &str = "mutation($input: CreateIssueInput!) { \
     createIssue(input: $input) { issue { url } } }";

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl<T> GraphqlResponse<T> {
    fn is_not_found(&self) -> bool {
        !self.errors.is_empty()
            && self
                .errors
                .iter()
                .all(|error| error.kind.as_deref() == Some("NOT_FOUND"))
    }

    fn into_data(self, operation: &str) -> Result<T, TrackerError> {
        if !self.errors.is_empty() {
            let messages = self
                .errors
                .iter()
                .map(|error| error.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TrackerError::Api(format!("{operation}: {messages}")));
        }
        self.data.ok_or_else(|| {
            TrackerError::InvalidResponse(format!("{operation}: response has no data"))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: ViewerNode,
}

#[derive(Debug, Deserialize)]
struct ViewerNode {
    login: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerData {
    repository_owner: Option<OwnerNode>,
}

#[derive(Debug, Deserialize)]
struct OwnerNode {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryData {
    repository: Option<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
struct RepositoryNode {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIssueData {
    create_issue: Option<CreateIssuePayload>,
}

#[derive(Debug, Deserialize)]
struct CreateIssuePayload {
    issue: Option<IssueNode>,
}

#[derive(Debug, Deserialize)]
struct IssueNode {
    url: String,
}

/// GraphQL client shared across users; the bearer credential is supplied per call.
#[derive(Clone)]
pub struct GithubGraphqlClient {
    http: reqwest::Client,
    graphql_url: String,
}

impl GithubGraphqlClient {
    pub fn new(api_base: &str, request_timeout_ms: u64) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("issuebot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create github graphql client")?;
        Ok(Self {
            http,
            graphql_url: format!("{}/graphql", api_base.trim_end_matches('/')),
        })
    }

    /// Confirms `owner` names a user or organization visible to `secret`.
    pub async fn check_owner(
        &self,
        secret: &CredentialSecret,
        owner: &str,
    ) -> Result<String, TrackerError> {
        let response: GraphqlResponse<OwnerData> = self
            .graphql(
                "check owner",
                None,
                secret,
                OWNER_QUERY,
                json!({ "login": owner }),
            )
            .await?;
        if response.is_not_found() {
            return Err(TrackerError::OwnerNotFound(owner.to_string()));
        }
        let data = response.into_data("check owner")?;
        let node = data
            .repository_owner
            .ok_or_else(|| TrackerError::OwnerNotFound(owner.to_string()))?;
        tracing::debug!(owner = %node.login, "github owner is accessible");
        Ok(node.login)
    }

    async fn repository_id(
        &self,
        ctx: &CommandContext,
        secret: &CredentialSecret,
        owner: &str,
        repo: &str,
    ) -> Result<String, TrackerError> {
        let not_found = || TrackerError::RepositoryNotFound {
            owner: owner.to_string(),
            repo: repo.to_string(),
        };
        let response: GraphqlResponse<RepositoryData> = self
            .graphql(
                "resolve repository",
                Some(ctx),
                secret,
                REPOSITORY_ID_QUERY,
                json!({ "owner": owner, "name": repo }),
            )
            .await?;
        if response.is_not_found() {
            return Err(not_found());
        }
        let data = response.into_data("resolve repository")?;
        data.repository.map(|node| node.id).ok_or_else(not_found)
    }

    async fn graphql<T>(
        &self,
        operation: &str,
        ctx: Option<&CommandContext>,
        secret: &CredentialSecret,
        query: &str,
        variables: Value,
    ) -> Result<GraphqlResponse<T>, TrackerError>
    where
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .post(&self.graphql_url)
            .bearer_auth(secret.expose())
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(ctx) = ctx {
            checkpoint(ctx)?;
            if let Some(remaining) = ctx.remaining() {
                request = request.timeout(remaining);
            }
        }

        let response = request.send().await.map_err(|error| {
            TrackerError::Transport(format!("github {operation} request failed: {error}"))
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TrackerError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::HttpStatus {
                status: status.as_u16(),
                body: truncate_for_error(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        response
            .json::<GraphqlResponse<T>>()
            .await
            .map_err(|error| {
                TrackerError::InvalidResponse(format!("failed to decode github {operation}: {error}"))
            })
    }
}

#[async_trait]
impl IssueTracker for GithubGraphqlClient {
    async fn create_issue(
        &self,
        ctx: &CommandContext,
        credential: &Credential,
        request: &IssueRequest,
    ) -> Result<CreatedIssue, TrackerError> {
        let repository_id = self
            .repository_id(ctx, credential.secret(), &request.owner, &request.repo)
            .await?;
        let response: GraphqlResponse<CreateIssueData> = self
            .graphql(
                "create issue",
                Some(ctx),
                credential.secret(),
                CREATE_ISSUE_MUTATION,
                json!({
                    "input": {
                        "repositoryId": repository_id,
                        "title": request.title,
                        "body": request.body,
                    }
                }),
            )
            .await?;
        let url = response
            .into_data("create issue")?
            .create_issue
            .and_then(|payload| payload.issue)
            .map(|issue| issue.url)
            .ok_or_else(|| {
                TrackerError::InvalidResponse("create issue: response has no issue url".to_string())
            })?;
        tracing::debug!(
            owner = %request.owner,
            repo = %request.repo,
            url = %url,
            "github issue created"
        );
        Ok(CreatedIssue { url })
    }

    async fn verify_credential(
        &self,
        ctx: &CommandContext,
        secret: &CredentialSecret,
    ) -> Result<TrackerIdentity, TrackerError> {
        let response: GraphqlResponse<ViewerData> = self
            .graphql("resolve viewer", Some(ctx), secret, VIEWER_QUERY, json!({}))
            .await?;
        let viewer = response.into_data("resolve viewer")?.viewer;
        Ok(TrackerIdentity {
            login: viewer.login,
            name: viewer.name,
        })
    }
}

fn checkpoint(ctx: &CommandContext) -> Result<(), TrackerError> {
    if ctx.is_cancelled() {
        return Err(TrackerError::Cancelled("shutdown"));
    }
    if ctx.remaining() == Some(Duration::ZERO) {
        return Err(TrackerError::Cancelled("deadline elapsed"));
    }
    Ok(())
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
