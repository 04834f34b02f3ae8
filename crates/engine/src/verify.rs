//! Webhook verification strategies.
//!
//! Every inbound HTTP trigger is checked by a [`WebhookVerifier`] before an
//! idempotency key is reserved, so a rejected delivery leaves no trace in
//! the ledger. Providers differ in three ways, all captured by the trait:
//!
//! - the GET handshake used to register the endpoint (hub challenge echo,
//!   computed CRC response, or none),
//! - where the HMAC-SHA256 signature lives and how it is encoded,
//! - which header, if any, carries a unique delivery id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::error::VerifyError;
use crate::models::{Transport, Trigger};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Strategy contract
// ---------------------------------------------------------------------------

/// Reply to a successful GET handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// `200 text/plain` echoing the challenge.
    Echo(String),
    /// `200 application/json` with a computed response.
    Json(Value),
}

/// Per-automation settings a verifier works with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifierParams {
    pub secret: Option<String>,
    pub verify_token: Option<String>,
    pub signature_header: Option<String>,
    pub delivery_id_header: Option<String>,
}

impl VerifierParams {
    pub fn for_trigger(trigger: &Trigger) -> Self {
        match trigger {
            Trigger::HttpGet { verify_token, .. } => Self {
                verify_token: verify_token.clone(),
                ..Self::default()
            },
            Trigger::HttpPost {
                secret,
                signature_header,
                delivery_id_header,
                ..
            } => Self {
                secret: secret.clone(),
                signature_header: signature_header.clone(),
                delivery_id_header: delivery_id_header.clone(),
                ..Self::default()
            },
            Trigger::Webhook { params, .. } => Self {
                secret: params.app_secret.clone(),
                verify_token: params.verify_token.clone(),
                ..Self::default()
            },
            Trigger::Cron { .. } | Trigger::DatabaseRecordCreated { .. } => Self::default(),
        }
    }
}

pub trait WebhookVerifier: Send + Sync {
    /// Answer a GET handshake. `None` means the query carries no handshake
    /// for this provider.
    fn handshake(
        &self,
        query: &BTreeMap<String, String>,
        params: &VerifierParams,
    ) -> Option<Result<Handshake, VerifyError>>;

    /// Check a delivery's authenticity. Unsigned deliveries are accepted
    /// only when no secret is configured.
    fn verify(&self, transport: &Transport, params: &VerifierParams) -> Result<(), VerifyError>;

    /// Provider-assigned unique id of this delivery.
    fn delivery_id(&self, transport: &Transport, params: &VerifierParams) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

/// `hub.mode=subscribe&hub.verify_token=..&hub.challenge=..` registration.
pub fn hub_handshake(
    query: &BTreeMap<String, String>,
    verify_token: Option<&str>,
) -> Option<Result<Handshake, VerifyError>> {
    let mode = query.get("hub.mode")?;
    if mode != "subscribe" {
        return Some(Err(VerifyError::UnsupportedHandshake));
    }

    let presented = query.get("hub.verify_token").map(String::as_bytes);
    let matches = match (verify_token, presented) {
        (Some(expected), Some(presented)) => constant_time_eq(expected.as_bytes(), presented),
        _ => false,
    };
    if !matches {
        return Some(Err(VerifyError::TokenMismatch));
    }

    let challenge = query.get("hub.challenge").cloned().unwrap_or_default();
    Some(Ok(Handshake::Echo(challenge)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// HMAC-SHA256 over the raw body, optionally prefixed with `sha256=`.
pub fn verify_hmac(
    secret: &str,
    body: &[u8],
    signature: &str,
    encoding: SignatureEncoding,
) -> Result<(), VerifyError> {
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = match encoding {
        SignatureEncoding::Hex => hex::decode(signature).map_err(|_| VerifyError::BadSignature)?,
        SignatureEncoding::Base64 => BASE64
            .decode(signature)
            .map_err(|_| VerifyError::BadSignature)?,
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| VerifyError::MissingSecret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| VerifyError::BadSignature)
}

pub fn sign_hex(secret: &str, body: &[u8]) -> String {
    hex::encode(mac_bytes(secret, body))
}

pub fn sign_base64(secret: &str, body: &[u8]) -> String {
    BASE64.encode(mac_bytes(secret, body))
}

fn mac_bytes(secret: &str, body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// For verify tokens. HMAC signatures go through `Mac::verify_slice`.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Shared signature check: look up `header`, then verify it if a secret is set.
fn check_signature(
    transport: &Transport,
    secret: Option<&str>,
    header: &str,
    encoding: SignatureEncoding,
) -> Result<(), VerifyError> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let signature = transport
        .header(header)
        .ok_or_else(|| VerifyError::MissingSignature(header.to_string()))?;
    verify_hmac(secret, &transport.raw_body, signature, encoding)
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Plain `http-get` / `http-post` automations: hub handshake with the
/// automation's token, hex HMAC in a configurable header.
pub struct GenericVerifier;

impl GenericVerifier {
    pub const DEFAULT_SIGNATURE_HEADER: &'static str = "x-signature";
}

impl WebhookVerifier for GenericVerifier {
    fn handshake(
        &self,
        query: &BTreeMap<String, String>,
        params: &VerifierParams,
    ) -> Option<Result<Handshake, VerifyError>> {
        hub_handshake(query, params.verify_token.as_deref())
    }

    fn verify(&self, transport: &Transport, params: &VerifierParams) -> Result<(), VerifyError> {
        let header = params
            .signature_header
            .as_deref()
            .unwrap_or(Self::DEFAULT_SIGNATURE_HEADER);
        check_signature(transport, params.secret.as_deref(), header, SignatureEncoding::Hex)
    }

    fn delivery_id(&self, transport: &Transport, params: &VerifierParams) -> Option<String> {
        let header = params.delivery_id_header.as_deref()?;
        transport.header(header).map(str::to_string)
    }
}

/// Meta (Facebook / Instagram / WhatsApp) graph webhooks.
pub struct MetaVerifier;

impl WebhookVerifier for MetaVerifier {
    fn handshake(
        &self,
        query: &BTreeMap<String, String>,
        params: &VerifierParams,
    ) -> Option<Result<Handshake, VerifyError>> {
        hub_handshake(query, params.verify_token.as_deref())
    }

    fn verify(&self, transport: &Transport, params: &VerifierParams) -> Result<(), VerifyError> {
        check_signature(
            transport,
            params.secret.as_deref(),
            "x-hub-signature-256",
            SignatureEncoding::Hex,
        )
    }

    fn delivery_id(&self, _transport: &Transport, _params: &VerifierParams) -> Option<String> {
        None
    }
}

pub struct GithubVerifier;

impl WebhookVerifier for GithubVerifier {
    fn handshake(
        &self,
        _query: &BTreeMap<String, String>,
        _params: &VerifierParams,
    ) -> Option<Result<Handshake, VerifyError>> {
        None
    }

    fn verify(&self, transport: &Transport, params: &VerifierParams) -> Result<(), VerifyError> {
        check_signature(
            transport,
            params.secret.as_deref(),
            "x-hub-signature-256",
            SignatureEncoding::Hex,
        )
    }

    fn delivery_id(&self, transport: &Transport, _params: &VerifierParams) -> Option<String> {
        transport.header("x-github-delivery").map(str::to_string)
    }
}

/// Twitter / X account activity: CRC challenge answered with an HMAC of the
/// nonce, base64 signatures on deliveries.
pub struct TwitterVerifier;

impl WebhookVerifier for TwitterVerifier {
    fn handshake(
        &self,
        query: &BTreeMap<String, String>,
        params: &VerifierParams,
    ) -> Option<Result<Handshake, VerifyError>> {
        let crc_token = query.get("crc_token")?;
        let Some(secret) = params.secret.as_deref() else {
            return Some(Err(VerifyError::MissingSecret));
        };
        let response_token = format!("sha256={}", sign_base64(secret, crc_token.as_bytes()));
        Some(Ok(Handshake::Json(json!({ "response_token": response_token }))))
    }

    fn verify(&self, transport: &Transport, params: &VerifierParams) -> Result<(), VerifyError> {
        check_signature(
            transport,
            params.secret.as_deref(),
            "x-twitter-webhooks-signature",
            SignatureEncoding::Base64,
        )
    }

    fn delivery_id(&self, _transport: &Transport, _params: &VerifierParams) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Provider registry
// ---------------------------------------------------------------------------

/// Name → strategy table, fixed at startup.
#[derive(Clone)]
pub struct VerifierSet {
    generic: Arc<dyn WebhookVerifier>,
    providers: HashMap<String, Arc<dyn WebhookVerifier>>,
}

impl VerifierSet {
    pub fn empty() -> Self {
        Self {
            generic: Arc::new(GenericVerifier),
            providers: HashMap::new(),
        }
    }

    pub fn with(mut self, provider: impl Into<String>, verifier: Arc<dyn WebhookVerifier>) -> Self {
        self.providers.insert(provider.into(), verifier);
        self
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn WebhookVerifier>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Strategy for an automation's trigger.
    pub fn for_trigger(&self, trigger: &Trigger) -> Option<Arc<dyn WebhookVerifier>> {
        match trigger {
            Trigger::Webhook { provider, .. } => self.provider(provider),
            Trigger::HttpGet { .. } | Trigger::HttpPost { .. } => Some(self.generic.clone()),
            Trigger::Cron { .. } | Trigger::DatabaseRecordCreated { .. } => None,
        }
    }
}

impl Default for VerifierSet {
    fn default() -> Self {
        Self::empty()
            .with("meta", Arc::new(MetaVerifier))
            .with("github", Arc::new(GithubVerifier))
            .with("twitter", Arc::new(TwitterVerifier))
            .with("generic", Arc::new(GenericVerifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn signed(header: &str, value: String, body: &[u8]) -> Transport {
        let mut transport = Transport {
            raw_body: body.to_vec(),
            ..Transport::default()
        };
        transport.headers.insert(header.to_string(), value);
        transport
    }

    #[test]
    fn hub_subscribe_with_matching_token_echoes_challenge() {
        let q = query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "s3cr3t"),
            ("hub.challenge", "abc123"),
        ]);
        assert_eq!(
            hub_handshake(&q, Some("s3cr3t")),
            Some(Ok(Handshake::Echo("abc123".into())))
        );
    }

    #[test]
    fn hub_token_mismatch_is_rejected() {
        let q = query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "wrong"),
            ("hub.challenge", "abc123"),
        ]);
        assert_eq!(hub_handshake(&q, Some("s3cr3t")), Some(Err(VerifyError::TokenMismatch)));
        assert_eq!(hub_handshake(&q, None), Some(Err(VerifyError::TokenMismatch)));
    }

    #[test]
    fn hub_other_modes_are_unsupported() {
        let q = query(&[("hub.mode", "unsubscribe"), ("hub.verify_token", "s3cr3t")]);
        assert_eq!(
            hub_handshake(&q, Some("s3cr3t")),
            Some(Err(VerifyError::UnsupportedHandshake))
        );
        assert_eq!(hub_handshake(&query(&[("page", "1")]), Some("s3cr3t")), None);
    }

    #[test]
    fn hex_signature_with_and_without_prefix() {
        let body = br#"{"event":"lead"}"#;
        let sig = sign_hex("key", body);
        assert!(verify_hmac("key", body, &sig, SignatureEncoding::Hex).is_ok());
        assert!(verify_hmac("key", body, &format!("sha256={sig}"), SignatureEncoding::Hex).is_ok());
        assert_eq!(
            verify_hmac("other", body, &sig, SignatureEncoding::Hex),
            Err(VerifyError::BadSignature)
        );
        assert_eq!(
            verify_hmac("key", body, "not-hex", SignatureEncoding::Hex),
            Err(VerifyError::BadSignature)
        );
    }

    #[test]
    fn generic_verifier_uses_configured_header() {
        let body = b"payload";
        let params = VerifierParams {
            secret: Some("key".into()),
            signature_header: Some("X-Acme-Signature".into()),
            delivery_id_header: Some("X-Acme-Delivery".into()),
            ..VerifierParams::default()
        };
        let mut transport = signed("x-acme-signature", sign_hex("key", body), body);
        transport
            .headers
            .insert("x-acme-delivery".into(), "d-1".into());

        assert!(GenericVerifier.verify(&transport, &params).is_ok());
        assert_eq!(GenericVerifier.delivery_id(&transport, &params).as_deref(), Some("d-1"));

        let unsigned = Transport::default();
        assert_eq!(
            GenericVerifier.verify(&unsigned, &params),
            Err(VerifyError::MissingSignature("X-Acme-Signature".into()))
        );
    }

    #[test]
    fn unsigned_delivery_passes_without_secret() {
        assert!(GenericVerifier
            .verify(&Transport::default(), &VerifierParams::default())
            .is_ok());
    }

    #[test]
    fn github_signature_and_delivery_id() {
        let body = b"{}";
        let params = VerifierParams {
            secret: Some("gh".into()),
            ..VerifierParams::default()
        };
        let mut transport = signed(
            "x-hub-signature-256",
            format!("sha256={}", sign_hex("gh", body)),
            body,
        );
        transport
            .headers
            .insert("x-github-delivery".into(), "72d3162e".into());

        assert!(GithubVerifier.verify(&transport, &params).is_ok());
        assert_eq!(
            GithubVerifier.delivery_id(&transport, &params).as_deref(),
            Some("72d3162e")
        );
    }

    #[test]
    fn twitter_crc_and_base64_signature() {
        let params = VerifierParams {
            secret: Some("consumer-secret".into()),
            ..VerifierParams::default()
        };
        let reply = TwitterVerifier
            .handshake(&query(&[("crc_token", "nonce")]), &params)
            .unwrap()
            .unwrap();
        let expected = format!("sha256={}", sign_base64("consumer-secret", b"nonce"));
        assert_eq!(reply, Handshake::Json(json!({ "response_token": expected })));

        let body = b"{\"for_user_id\":\"1\"}";
        let transport = signed(
            "x-twitter-webhooks-signature",
            format!("sha256={}", sign_base64("consumer-secret", body)),
            body,
        );
        assert!(TwitterVerifier.verify(&transport, &params).is_ok());
    }

    #[test]
    fn default_set_knows_builtin_providers() {
        let set = VerifierSet::default();
        for name in ["meta", "github", "twitter", "generic"] {
            assert!(set.contains(name), "{name}");
        }
        assert!(set.provider("slack").is_none());
    }
}
