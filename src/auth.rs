use crate::database::Database;
use crate::errors::LedgerEngineError;
use actix_web::{
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::future::LocalBoxFuture;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller, reduced to what the core uses. The ledger id
/// is authoritative for every downstream operation.
#[derive(Debug, Clone)]
pub struct Principal {
    pub api_key_id: Uuid,
    pub ledger_id: Uuid,
}

impl FromRequest for Principal {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Principal>()
                .cloned()
                .ok_or_else(|| LedgerEngineError::Unauthorized.into()),
        )
    }
}

/// Keys are stored as HMAC-SHA-256 over the raw key under a service-level
/// secret, so a database leak does not leak usable credentials.
pub fn compute_key_hash(secret: &[u8], api_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(api_key.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

pub struct ApiKeyAuth {
    db: Arc<Database>,
    secret: Arc<Vec<u8>>,
}

impl ApiKeyAuth {
    pub fn new(db: Arc<Database>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            db,
            secret: Arc::new(secret.into()),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiKeyAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = ApiKeyAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApiKeyAuthMiddleware {
            service: Rc::new(service),
            db: self.db.clone(),
            secret: self.secret.clone(),
        }))
    }
}

pub struct ApiKeyAuthMiddleware<S> {
    service: Rc<S>,
    db: Arc<Database>,
    secret: Arc<Vec<u8>>,
}

impl<S, B> Service<ServiceRequest> for ApiKeyAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Health and metrics stay reachable without a credential.
        if req.path() == "/health" || req.path() == "/metrics" {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await });
        }

        let token = match bearer_token(&req) {
            Some(token) => token.to_string(),
            None => {
                return Box::pin(async { Err(LedgerEngineError::Unauthorized.into()) });
            }
        };

        let key_hash = compute_key_hash(&self.secret, &token);
        let db = self.db.clone();
        let service = self.service.clone();

        Box::pin(async move {
            match db.find_principal_by_key_hash(&key_hash).await {
                Ok(Some((api_key_id, ledger_id))) => {
                    req.extensions_mut().insert(Principal {
                        api_key_id,
                        ledger_id,
                    });
                    service.call(req).await
                }
                Ok(None) => Err(LedgerEngineError::Unauthorized.into()),
                Err(e) => {
                    tracing::error!("principal lookup failed: {}", e);
                    Err(e.into())
                }
            }
        })
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<&str> {
    let raw = req.headers().get("Authorization")?.to_str().ok()?;
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_deterministic_and_secret_dependent() {
        let h1 = compute_key_hash(b"secret-a", "lk_test_123");
        let h2 = compute_key_hash(b"secret-a", "lk_test_123");
        let h3 = compute_key_hash(b"secret-b", "lk_test_123");
        let h4 = compute_key_hash(b"secret-a", "lk_test_124");

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_ne!(h1, h4);
    }
}
