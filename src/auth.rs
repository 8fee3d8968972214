//! Bearer-token handshake parameters.
//!
//! The credential can ride on the upgrade request as an `Authorization`
//! header, as a `token` query parameter for transports that cannot set
//! headers on the initial handshake, or both. Validity of the token is the
//! server's business; a missing token simply produces no auth parameters.

use crate::error::Error;
use http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use url::Url;

/// Query parameter carrying the token
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Where the bearer token is placed on the upgrade request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>` only
    Header,
    /// `?token=<token>` only
    Query,
    /// Both forms
    #[default]
    Both,
}

/// Parameters applied to the WebSocket upgrade request
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub query_params: Vec<(String, String)>,
}

impl ConnectionParams {
    /// `true` if no credential will be sent
    pub fn is_anonymous(&self) -> bool {
        self.headers.is_empty() && self.query_params.is_empty()
    }

    /// Build the upgrade request for `url` with these parameters applied.
    pub fn into_request(self, url: &Url) -> Result<Request, Error> {
        let mut url = url.clone();
        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::dial(format!("Invalid WebSocket request: {}", e)))?;

        for (name, value) in self.headers {
            request.headers_mut().insert(name, value);
        }

        Ok(request)
    }
}

/// Turns a bearer credential into connection-establishment parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthHandshake {
    placement: TokenPlacement,
}

impl AuthHandshake {
    pub fn new(placement: TokenPlacement) -> Self {
        Self { placement }
    }

    pub fn placement(&self) -> TokenPlacement {
        self.placement
    }

    /// Produce the header and/or query parameter for `token`.
    ///
    /// Empty or missing tokens yield empty parameters.
    pub fn build_connection_params(&self, token: Option<&str>) -> Result<ConnectionParams, Error> {
        let mut params = ConnectionParams::default();

        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(params),
        };

        if matches!(self.placement, TokenPlacement::Header | TokenPlacement::Both) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                Error::InvalidCredential("token contains bytes not allowed in a header".to_string())
            })?;
            value.set_sensitive(true);
            params.headers.push((http::header::AUTHORIZATION, value));
        }

        if matches!(self.placement, TokenPlacement::Query | TokenPlacement::Both) {
            params
                .query_params
                .push((TOKEN_QUERY_PARAM.to_string(), token.to_string()));
        }

        Ok(params)
    }
}

/// Render a URL for logging with credentials and the token parameter masked.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    if !redacted.username().is_empty() || redacted.password().is_some() {
        let _ = redacted.set_username("***");
        let _ = redacted.set_password(Some("***"));
    }

    if redacted.query().is_some() {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                if k == TOKEN_QUERY_PARAM {
                    (k.into_owned(), "***".to_string())
                } else {
                    (k.into_owned(), v.into_owned())
                }
            })
            .collect();
        redacted.query_pairs_mut().clear().extend_pairs(pairs);
    }

    redacted.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_forms_by_default() {
        let params = AuthHandshake::default()
            .build_connection_params(Some("abc.def.ghi"))
            .unwrap();

        assert_eq!(params.headers.len(), 1);
        assert_eq!(params.headers[0].0, http::header::AUTHORIZATION);
        assert_eq!(params.headers[0].1.to_str().unwrap(), "Bearer abc.def.ghi");
        assert!(params.headers[0].1.is_sensitive());
        assert_eq!(
            params.query_params,
            vec![("token".to_string(), "abc.def.ghi".to_string())]
        );
    }

    #[test]
    fn test_single_placement() {
        let header_only = AuthHandshake::new(TokenPlacement::Header)
            .build_connection_params(Some("t"))
            .unwrap();
        assert_eq!(header_only.headers.len(), 1);
        assert!(header_only.query_params.is_empty());

        let query_only = AuthHandshake::new(TokenPlacement::Query)
            .build_connection_params(Some("t"))
            .unwrap();
        assert!(query_only.headers.is_empty());
        assert_eq!(query_only.query_params.len(), 1);
    }

    #[test]
    fn test_missing_or_empty_token_is_anonymous() {
        let handshake = AuthHandshake::default();
        assert!(handshake.build_connection_params(None).unwrap().is_anonymous());
        assert!(handshake.build_connection_params(Some("")).unwrap().is_anonymous());
    }

    #[test]
    fn test_token_with_newline_rejected() {
        let result = AuthHandshake::new(TokenPlacement::Header).build_connection_params(Some("a\nb"));
        assert!(matches!(result, Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn test_into_request_applies_params() {
        let url = Url::parse("ws://localhost:9000/ws?room=lobby").unwrap();
        let request = AuthHandshake::default()
            .build_connection_params(Some("tok en"))
            .unwrap()
            .into_request(&url)
            .unwrap();

        assert_eq!(request.uri().path(), "/ws");
        assert_eq!(request.uri().query(), Some("room=lobby&token=tok+en"));
        assert_eq!(
            request.headers().get(http::header::AUTHORIZATION).unwrap(),
            "Bearer tok en"
        );
        // Upgrade headers are still present
        assert!(request.headers().contains_key("sec-websocket-key"));
    }

    #[test]
    fn test_redact_url() {
        let url = Url::parse("wss://user:pw@chat.example.com/ws?room=1&token=secret").unwrap();
        let redacted = redact_url(&url);
        assert!(!redacted.contains("secret"));
        assert!(!redacted.contains("pw"));
        assert!(redacted.contains("room=1"));
        assert!(redacted.contains("token=***") || redacted.contains("token=%2A%2A%2A"));
    }
}
