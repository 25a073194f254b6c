//! GitHub GraphQL implementation of the issue tracker collaborator.

mod github_graphql_client;

pub use github_graphql_client::{GithubGraphqlClient, DEFAULT_GITHUB_API_BASE};
