//! Credential vault: encrypt-at-rest storage for exchange API keys.
//!
//! Reads expose only the masked form; plaintext leaves the vault solely
//! through the `CredentialSource` pull path used by the execution
//! coordinator. A rotated master key leaves existing rows undecryptable:
//! masked reads then report `configured` with no masked key, and the
//! plaintext path surfaces an auth error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use funding_engine::{CredentialSource, EngineError, EngineResult};
use venue_adapters::{VenueCredential, VenueId};

use crate::crypto::CredentialCipher;
use crate::error::{DatabaseError, DatabaseResult};

/// Masked view of a stored credential: the only shape that appears in
/// API responses and logs.
#[derive(Debug, Clone, Serialize)]
pub struct MaskedCredential {
    pub exchange: VenueId,
    pub configured: bool,
    pub api_key_masked: Option<String>,
    pub has_passphrase: bool,
    pub testnet: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MaskedCredential {
    fn unconfigured(exchange: VenueId) -> Self {
        Self {
            exchange,
            configured: false,
            api_key_masked: None,
            has_passphrase: false,
            testnet: None,
            updated_at: None,
        }
    }
}

/// First four and last four characters joined by `***`. Keys too short
/// to split reveal nothing at all.
pub fn mask_api_key(api_key: &str) -> String {
    let value = api_key.trim();
    if value.len() < 8 {
        return "***".to_string();
    }
    format!("{}***{}", &value[..4], &value[value.len() - 4..])
}

/// Payload accepted by `put`.
#[derive(Clone, serde::Deserialize)]
pub struct CredentialUpsert {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

impl std::fmt::Debug for CredentialUpsert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialUpsert")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .field("testnet", &self.testnet)
            .finish()
    }
}

pub struct CredentialVault {
    pool: PgPool,
    cipher: Option<CredentialCipher>,
}

impl CredentialVault {
    /// Build the vault. Without a master key the vault is read-disabled:
    /// status listings still work, but nothing can be stored or pulled.
    pub fn new(pool: PgPool, master_key: Option<&str>) -> DatabaseResult<Self> {
        let cipher = match master_key {
            Some(raw) => Some(CredentialCipher::from_master_key(raw)?),
            None => {
                warn!("credential encryption key not configured; vault writes are disabled");
                None
            }
        };
        Ok(Self { pool, cipher })
    }

    pub fn enabled(&self) -> bool {
        self.cipher.is_some()
    }

    fn cipher(&self) -> DatabaseResult<&CredentialCipher> {
        self.cipher.as_ref().ok_or_else(|| {
            DatabaseError::Configuration(
                "credential vault disabled: FA_CREDENTIAL_ENCRYPTION_KEY is not set".to_string(),
            )
        })
    }

    /// Encrypt and upsert one venue's credential, returning the masked
    /// view.
    pub async fn put(
        &self,
        exchange: VenueId,
        credential: CredentialUpsert,
    ) -> DatabaseResult<MaskedCredential> {
        let api_key = credential.api_key.trim().to_string();
        let api_secret = credential.api_secret.trim().to_string();
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(DatabaseError::Configuration(
                "api_key and api_secret must not be empty".to_string(),
            ));
        }
        let passphrase = credential
            .passphrase
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let cipher = self.cipher()?;
        let api_key_enc = cipher.encrypt(&api_key)?;
        let api_secret_enc = cipher.encrypt(&api_secret)?;
        let passphrase_enc = passphrase.map(|value| cipher.encrypt(value)).transpose()?;

        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO exchange_credentials
                (exchange, api_key_enc, api_secret_enc, passphrase_enc, testnet, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (exchange) DO UPDATE SET
                api_key_enc = EXCLUDED.api_key_enc,
                api_secret_enc = EXCLUDED.api_secret_enc,
                passphrase_enc = EXCLUDED.passphrase_enc,
                testnet = EXCLUDED.testnet,
                updated_at = EXCLUDED.updated_at
            RETURNING updated_at
            "#,
        )
        .bind(exchange.as_str())
        .bind(&api_key_enc)
        .bind(&api_secret_enc)
        .bind(&passphrase_enc)
        .bind(credential.testnet)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!(%exchange, "credential stored");
        Ok(MaskedCredential {
            exchange,
            configured: true,
            api_key_masked: Some(mask_api_key(&api_key)),
            has_passphrase: passphrase.is_some(),
            testnet: Some(credential.testnet),
            updated_at: Some(row.try_get("updated_at")?),
        })
    }

    /// Masked view for one venue.
    pub async fn get_masked(&self, exchange: VenueId) -> DatabaseResult<MaskedCredential> {
        let row = sqlx::query(
            "SELECT api_key_enc, passphrase_enc, testnet, updated_at
             FROM exchange_credentials WHERE exchange = $1",
        )
        .bind(exchange.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(MaskedCredential::unconfigured(exchange)),
        };

        // A rotated master key leaves the row configured but unmaskable.
        let api_key_masked = match (&self.cipher, row.try_get::<String, _>("api_key_enc")) {
            (Some(cipher), Ok(token)) => cipher
                .decrypt(&token)
                .ok()
                .map(|api_key| mask_api_key(&api_key)),
            _ => None,
        };

        Ok(MaskedCredential {
            exchange,
            configured: true,
            api_key_masked,
            has_passphrase: row.try_get::<Option<String>, _>("passphrase_enc")?.is_some(),
            testnet: Some(row.try_get("testnet")?),
            updated_at: Some(row.try_get("updated_at")?),
        })
    }

    /// Masked status for every supported venue.
    pub async fn list_status(&self) -> DatabaseResult<Vec<MaskedCredential>> {
        let mut items = Vec::with_capacity(VenueId::ALL.len());
        for venue in VenueId::ALL {
            items.push(self.get_masked(venue).await?);
        }
        Ok(items)
    }

    /// Remove one venue's credential. Returns whether a row existed.
    pub async fn delete(&self, exchange: VenueId) -> DatabaseResult<bool> {
        let result = sqlx::query("DELETE FROM exchange_credentials WHERE exchange = $1")
            .bind(exchange.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CredentialSource for CredentialVault {
    async fn plaintext(&self, venue: VenueId) -> EngineResult<Option<VenueCredential>> {
        let row = sqlx::query(
            "SELECT api_key_enc, api_secret_enc, passphrase_enc, testnet
             FROM exchange_credentials WHERE exchange = $1",
        )
        .bind(venue.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| EngineError::internal(err.to_string()))?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let cipher = self.cipher.as_ref().ok_or_else(|| {
            EngineError::auth("credential vault disabled: encryption key not configured")
        })?;

        let api_key_enc: String = row
            .try_get("api_key_enc")
            .map_err(|err| EngineError::internal(err.to_string()))?;
        let api_secret_enc: String = row
            .try_get("api_secret_enc")
            .map_err(|err| EngineError::internal(err.to_string()))?;
        let passphrase_enc: Option<String> = row
            .try_get("passphrase_enc")
            .map_err(|err| EngineError::internal(err.to_string()))?;
        let testnet: bool = row
            .try_get("testnet")
            .map_err(|err| EngineError::internal(err.to_string()))?;

        // Decryption failure is an auth condition, not a server fault.
        let api_key = cipher.decrypt(&api_key_enc).map_err(EngineError::from)?;
        let api_secret = cipher.decrypt(&api_secret_enc).map_err(EngineError::from)?;
        let passphrase = passphrase_enc
            .map(|token| cipher.decrypt(&token))
            .transpose()
            .map_err(EngineError::from)?;

        Ok(Some(VenueCredential::new(
            api_key,
            api_secret,
            passphrase,
            testnet,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_api_key_shapes() {
        assert_eq!(mask_api_key("ABCDEFGHWXYZ"), "ABCD***WXYZ");
        assert_eq!(mask_api_key("ABCD1234"), "ABCD***1234");
        assert_eq!(mask_api_key("short"), "***");
        assert_eq!(mask_api_key(""), "***");
    }

    #[test]
    fn test_mask_reveals_no_interior_substring() {
        let api_key = "AAAA-interior-secret-ZZZZ";
        let masked = mask_api_key(api_key);
        assert_eq!(masked, "AAAA***ZZZZ");
        assert!(!masked.contains("interior"));
        assert!(!masked.contains("secret"));
    }

    #[test]
    fn test_upsert_debug_redacts() {
        let upsert = CredentialUpsert {
            api_key: "key-material".into(),
            api_secret: "secret-material".into(),
            passphrase: Some("phrase".into()),
            testnet: false,
        };
        let rendered = format!("{upsert:?}");
        assert!(!rendered.contains("key-material"));
        assert!(!rendered.contains("secret-material"));
        assert!(!rendered.contains("phrase"));
    }
}
