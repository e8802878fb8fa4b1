//! # Auth Plugin
//!
//! Wallet-signature challenge/verify, token issue/verify, and NFT-ownership
//! assertion. The cryptography itself is an external collaborator: chain
//! signature verification sits behind [`SignatureVerifier`] and on-chain
//! ownership behind [`ChainClient`]. This plugin owns the nonce lifecycle,
//! the token format, and the endpoint surface.
//!
//! Tokens are HS256 JWTs carrying `sub` (wallet), `iss`, `aud`, `exp`,
//! `iat`, `jti`. Verification checks signature, expiry, issuer, and
//! audience; the MAC comparison is the library's constant-time check.

use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use super::PluginBase;
use crate::error::{Result, ServiceError};
use crate::kernel::plugin::{Plugin, PluginContext, PluginDescriptor, PluginHealth};
use crate::pipeline::validate::{FieldKind, FieldRule};
use crate::pipeline::{ApiRequest, ApiResponse, Endpoint, EndpointSpec, FnHandler};

/// Chain families a wallet signature can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Evm,
    Solana,
}

/// External collaborator: verifies a wallet's signature over a nonce for
/// one chain family.
#[async_trait::async_trait]
pub trait SignatureVerifier: Send + Sync {
    fn chain(&self) -> ChainFamily;
    async fn verify(&self, wallet: &str, nonce: &str, signature: &str) -> Result<bool>;
}

/// External collaborator: answers NFT ownership queries on chain.
#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    async fn owns(
        &self,
        wallet: &str,
        collection: &str,
        token_id: Option<&str>,
    ) -> Result<bool>;
}

/// Auth failures, mapped onto the service taxonomy at the endpoint edge.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no outstanding challenge for wallet")]
    NonceUnknown,
    #[error("challenge expired")]
    NonceExpired,
    #[error("signature rejected")]
    SignatureInvalid,
    #[error("token expired")]
    TokenExpired,
    #[error("token malformed")]
    TokenMalformed,
    #[error("chain backend unavailable")]
    ChainUnavailable,
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::ChainUnavailable => ServiceError::Upstream {
                message: err.to_string(),
            },
            other => ServiceError::Unauthorized {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iss: String,
    aud: String,
    exp: u64,
    iat: u64,
    jti: String,
}

/// Verified token identity handed back to callers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Identity {
    pub wallet: String,
    pub token_id: String,
}

struct NonceEntry {
    nonce: String,
    expires: Instant,
}

struct AuthCore {
    secret: Vec<u8>,
    issuer: String,
    audience: String,
    token_ttl: Duration,
    nonce_ttl: Duration,
    nonces: DashMap<String, NonceEntry>,
    verifiers: DashMap<ChainFamily, Arc<dyn SignatureVerifier>>,
    chain: Option<Arc<dyn ChainClient>>,
}

impl AuthCore {
    /// Issue a fresh one-time nonce for `wallet`, replacing any previous
    /// outstanding challenge.
    fn challenge(&self, wallet: &str) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = hex_encode(&bytes);
        self.nonces.insert(
            wallet.to_lowercase(),
            NonceEntry {
                nonce: nonce.clone(),
                expires: Instant::now() + self.nonce_ttl,
            },
        );
        nonce
    }

    /// Consume the wallet's nonce and verify the signature with the chain's
    /// verifier. The nonce is gone after this call whatever the outcome.
    async fn verify_signature(
        &self,
        wallet: &str,
        nonce: &str,
        signature: &str,
        chain: ChainFamily,
    ) -> std::result::Result<String, AuthError> {
        let entry = self
            .nonces
            .remove(&wallet.to_lowercase())
            .map(|(_, entry)| entry)
            .ok_or(AuthError::NonceUnknown)?;
        if entry.expires < Instant::now() {
            return Err(AuthError::NonceExpired);
        }
        if entry.nonce != nonce {
            return Err(AuthError::NonceUnknown);
        }
        let verifier = self
            .verifiers
            .get(&chain)
            .map(|v| v.value().clone())
            .ok_or(AuthError::ChainUnavailable)?;
        let valid = verifier
            .verify(wallet, nonce, signature)
            .await
            .map_err(|_| AuthError::ChainUnavailable)?;
        if !valid {
            return Err(AuthError::SignatureInvalid);
        }
        self.issue_token(wallet)
    }

    fn issue_token(&self, wallet: &str) -> std::result::Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let claims = Claims {
            sub: wallet.to_lowercase(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: now + self.token_ttl.as_secs(),
            iat: now,
            jti: Uuid::new_v4().to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|_| AuthError::TokenMalformed)
    }

    fn verify_token(&self, token: &str) -> std::result::Result<Identity, AuthError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::TokenMalformed,
        })?;
        Ok(Identity {
            wallet: decoded.claims.sub,
            token_id: decoded.claims.jti,
        })
    }

    async fn verify_nft(
        &self,
        wallet: &str,
        collection: &str,
        token_id: Option<&str>,
    ) -> std::result::Result<bool, AuthError> {
        let chain = self.chain.as_ref().ok_or(AuthError::ChainUnavailable)?;
        chain
            .owns(wallet, collection, token_id)
            .await
            .map_err(|_| AuthError::ChainUnavailable)
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.nonces.retain(|_, entry| entry.expires > now);
    }
}

pub struct AuthPlugin {
    base: PluginBase,
    verifiers: Vec<Arc<dyn SignatureVerifier>>,
    chain: Option<Arc<dyn ChainClient>>,
    /// Built from configuration at init; absent before that.
    core: std::sync::RwLock<Option<Arc<AuthCore>>>,
}

impl AuthPlugin {
    pub fn new(
        verifiers: Vec<Arc<dyn SignatureVerifier>>,
        chain: Option<Arc<dyn ChainClient>>,
    ) -> Self {
        Self {
            base: PluginBase::new("auth"),
            verifiers,
            chain,
            core: std::sync::RwLock::new(None),
        }
    }

    /// Deployment default: no verifiers or chain client wired. Signature
    /// and NFT endpoints answer `ChainUnavailable` until the deployment
    /// provides collaborators.
    pub fn with_default_collaborators() -> Self {
        Self::new(Vec::new(), None)
    }

    pub fn base(&self) -> &PluginBase {
        &self.base
    }

    fn core(&self) -> Result<Arc<AuthCore>> {
        self.core
            .read()
            .expect("auth core lock poisoned")
            .clone()
            .ok_or_else(|| ServiceError::internal("auth used before init"))
    }

    fn endpoints(&self, core: Arc<AuthCore>) -> Vec<Endpoint> {
        let challenge_core = core.clone();
        let challenge = Endpoint::new(
            EndpointSpec::post("auth.challenge", "/auth/challenge").rules(vec![
                FieldRule::required_body("wallet", FieldKind::HexAddress),
            ]),
            Arc::new(FnHandler(move |req: ApiRequest| {
                let core = challenge_core.clone();
                async move {
                    let wallet = body_str(&req, "wallet")?;
                    let nonce = core.challenge(&wallet);
                    Ok(ApiResponse::ok(json!({
                        "wallet": wallet.to_lowercase(),
                        "nonce": nonce,
                        "expires_in_secs": core.nonce_ttl.as_secs(),
                    })))
                }
            })),
        );

        let verify_core = core.clone();
        let verify = Endpoint::new(
            EndpointSpec::post("auth.verify", "/auth/verify").rules(vec![
                FieldRule::required_body("wallet", FieldKind::HexAddress),
                FieldRule::required_body("nonce", FieldKind::Str { min: 8, max: 128 }),
                FieldRule::required_body("signature", FieldKind::Str { min: 8, max: 4096 }),
            ]),
            Arc::new(FnHandler(move |req: ApiRequest| {
                let core = verify_core.clone();
                async move {
                    let wallet = body_str(&req, "wallet")?;
                    let nonce = body_str(&req, "nonce")?;
                    let signature = body_str(&req, "signature")?;
                    let chain = match req
                        .body
                        .as_ref()
                        .and_then(|b| b.get("chain"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("evm")
                    {
                        "solana" => ChainFamily::Solana,
                        _ => ChainFamily::Evm,
                    };
                    let token = core
                        .verify_signature(&wallet, &nonce, &signature, chain)
                        .await
                        .map_err(ServiceError::from)?;
                    Ok(ApiResponse::ok(json!({"token": token})))
                }
            })),
        );

        let token_core = core.clone();
        let token_verify = Endpoint::new(
            EndpointSpec::post("auth.token.verify", "/auth/token/verify").rules(vec![
                FieldRule::required_body("token", FieldKind::Str { min: 16, max: 8192 }),
            ]),
            Arc::new(FnHandler(move |req: ApiRequest| {
                let core = token_core.clone();
                async move {
                    let token = body_str(&req, "token")?;
                    let identity = core.verify_token(&token).map_err(ServiceError::from)?;
                    Ok(ApiResponse::ok(json!({"identity": identity})))
                }
            })),
        );

        let nft_core = core;
        let nft = Endpoint::new(
            EndpointSpec::post("auth.nft.verify", "/auth/nft/verify").rules(vec![
                FieldRule::required_body("wallet", FieldKind::HexAddress),
                FieldRule::required_body("collection", FieldKind::HexAddress),
            ]),
            Arc::new(FnHandler(move |req: ApiRequest| {
                let core = nft_core.clone();
                async move {
                    let wallet = body_str(&req, "wallet")?;
                    let collection = body_str(&req, "collection")?;
                    let token_id = req
                        .body
                        .as_ref()
                        .and_then(|b| b.get("token_id"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    let owned = core
                        .verify_nft(&wallet, &collection, token_id.as_deref())
                        .await
                        .map_err(ServiceError::from)?;
                    Ok(ApiResponse::ok(json!({"owned": owned})))
                }
            })),
        );

        vec![challenge, verify, token_verify, nft]
    }
}

#[async_trait::async_trait]
impl Plugin for AuthPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor::new("auth")
            .with_endpoints(&[
                ("POST", "/auth/challenge"),
                ("POST", "/auth/verify"),
                ("POST", "/auth/token/verify"),
                ("POST", "/auth/nft/verify"),
            ])
            .with_dependencies(self.base.dependencies())
    }

    async fn init(&self, ctx: PluginContext) -> Result<()> {
        let auth = &ctx.resources.config.auth;
        if auth.token_secret.is_empty() {
            tracing::warn!("auth.token_secret is empty, generating an ephemeral secret");
        }
        let secret = if auth.token_secret.is_empty() {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes.to_vec()
        } else {
            auth.token_secret.clone().into_bytes()
        };
        let verifiers = DashMap::new();
        for verifier in &self.verifiers {
            verifiers.insert(verifier.chain(), verifier.clone());
        }
        // Core settings are fixed for the plugin's lifetime once injected.
        let core = Arc::new(AuthCore {
            secret,
            issuer: auth.issuer.clone(),
            audience: auth.audience.clone(),
            token_ttl: auth.token_ttl,
            nonce_ttl: auth.nonce_ttl,
            nonces: DashMap::new(),
            verifiers,
            chain: self.chain.clone(),
        });
        *self.core.write().expect("auth core lock poisoned") = Some(core);
        self.base.store_ctx(ctx).await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.base.ctx().await?;
        let core = self.core()?;
        for endpoint in self.endpoints(core.clone()) {
            ctx.resources.endpoints.register("auth", endpoint);
        }
        // Expired challenges are swept on the shutdown-aware interval.
        let cancel = ctx.shutdown.child_token();
        let interval = core.nonce_ttl.max(Duration::from_secs(30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => core.sweep_expired(),
                }
            }
        });
        self.base.join_fabric().await
    }

    async fn stop(&self) -> Result<()> {
        self.base.leave_fabric().await
    }

    async fn health(&self) -> PluginHealth {
        if self.base.is_ready() {
            PluginHealth::ready()
        } else {
            PluginHealth::not_ready("auth not started")
        }
    }
}

fn body_str(req: &ApiRequest, field: &str) -> Result<String> {
    req.body
        .as_ref()
        .and_then(|b| b.get(field))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ServiceError::invalid_input(format!("missing field '{field}'")))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
