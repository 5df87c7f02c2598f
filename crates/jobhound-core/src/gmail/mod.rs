pub mod client;
pub mod oauth;
pub mod parser;
pub mod provider;
pub mod types;

pub use client::{GmailClient, GmailClientError};
pub use oauth::{
    AccountTokenStore, ClientCredentials, DEFAULT_REFRESH_BUFFER, OAuthError, OAuthTokens,
    TokenStore, refresh_tokens,
};
pub use parser::{ParsedMessage, parse_message, to_raw_message};
pub use provider::GmailProvider;
