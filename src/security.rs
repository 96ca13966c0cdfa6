// AFDX-lite - TDMA gateway protocol core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Session security manager
//!
//! Owns every piece of key material the gateway holds:
//! - Device key records (symmetric device key + Ed25519 public key)
//! - Sessions issued after challenge authentication
//! - Single-use challenge nonces
//! - The master key used to wrap device keys for delivery
//!
//! Rotation is poll-driven like the scheduler: [`SessionSecurityManager::start`]
//! arms it, [`SessionSecurityManager::poll`] runs it when due.

use std::collections::HashMap;
use std::fmt;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::crypto::{self, KeyBytes};
use crate::error::SecurityError;

/// Security manager configuration
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Session lifetime (ms)
    pub session_ttl_ms: u64,
    /// Challenge nonce lifetime (ms)
    pub nonce_ttl_ms: u64,
    /// Period of master/device key rotation (ms)
    pub key_rotation_interval_ms: u64,
    /// Devices used within this window get a fresh key on rotation (ms)
    pub activity_window_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: 30 * 60 * 1000,
            nonce_ttl_ms: 5 * 60 * 1000,
            key_rotation_interval_ms: 60 * 60 * 1000,
            activity_window_ms: 60 * 60 * 1000,
        }
    }
}

impl SecurityConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the rotation period
    pub fn with_rotation_interval(mut self, interval_ms: u64) -> Self {
        self.key_rotation_interval_ms = interval_ms;
        self
    }

    /// Override the session lifetime
    pub fn with_session_ttl(mut self, ttl_ms: u64) -> Self {
        self.session_ttl_ms = ttl_ms;
        self
    }
}

/// Key material registered for one device
#[derive(Clone)]
pub struct DeviceKeyRecord {
    pub device_id: String,
    key: KeyBytes,
    public_key: VerifyingKey,
    pub registered_at: u64,
    pub last_used: u64,
}

impl DeviceKeyRecord {
    /// Hex of the registered public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.to_bytes())
    }
}

impl fmt::Debug for DeviceKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeyRecord")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key_hex())
            .field("registered_at", &self.registered_at)
            .field("last_used", &self.last_used)
            .finish()
    }
}

/// An authenticated session
#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    key: KeyBytes,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Session {
    /// Expired at or after `expires_at`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("device_id", &self.device_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outstanding challenge nonce of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRecord {
    pub device_id: String,
    pub nonce: String,
    pub issued_at: u64,
    pub used: bool,
}

/// What a device receives after authenticating
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_id: String,
    /// Session key sealed under the device key, session id as associated data
    pub session_key: String,
    pub expires_at: u64,
}

/// Outcome of one key rotation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub rekeyed_devices: usize,
    pub sessions_purged: usize,
    pub nonces_purged: usize,
}

/// Session security manager
pub struct SessionSecurityManager {
    config: SecurityConfig,
    master_key: KeyBytes,
    devices: HashMap<String, DeviceKeyRecord>,
    sessions: HashMap<String, Session>,
    nonces: HashMap<String, NonceRecord>,
    next_rotation: Option<u64>,
}

impl fmt::Debug for SessionSecurityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSecurityManager")
            .field("config", &self.config)
            .field("devices", &self.devices.len())
            .field("sessions", &self.sessions.len())
            .field("nonces", &self.nonces.len())
            .field("next_rotation", &self.next_rotation)
            .finish()
    }
}

impl SessionSecurityManager {
    /// Create a manager with a fresh master key
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config,
            master_key: crypto::random_key(),
            devices: HashMap::new(),
            sessions: HashMap::new(),
            nonces: HashMap::new(),
            next_rotation: None,
        }
    }

    /// Get configuration
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Register a device and return its new key sealed under the master key
    ///
    /// Re-registering replaces the previous key record.
    pub fn register_device(
        &mut self,
        device_id: &str,
        public_key_hex: &str,
        now_ms: u64,
    ) -> Result<String, SecurityError> {
        let invalid = || SecurityError::InvalidPublicKey {
            device_id: device_id.to_string(),
        };
        let bytes: [u8; 32] = hex::decode(public_key_hex)
            .map_err(|_| invalid())?
            .try_into()
            .map_err(|_| invalid())?;
        let public_key = VerifyingKey::from_bytes(&bytes).map_err(|_| invalid())?;

        let key = crypto::random_key();
        let sealed = crypto::seal(&self.master_key, &key, device_id.as_bytes())
            .map_err(|e| SecurityError::CryptoFailure(e.to_string()))?;

        self.devices.insert(
            device_id.to_string(),
            DeviceKeyRecord {
                device_id: device_id.to_string(),
                key,
                public_key,
                registered_at: now_ms,
                last_used: now_ms,
            },
        );
        log::debug!("registered key for {}", device_id);
        Ok(sealed)
    }

    /// Verify a signed challenge and open a session
    pub fn authenticate_device(
        &mut self,
        device_id: &str,
        challenge: &str,
        signature_hex: &str,
        now_ms: u64,
    ) -> Result<SessionGrant, SecurityError> {
        let record = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| SecurityError::DeviceNotRegistered {
                device_id: device_id.to_string(),
            })?;

        let signature = hex::decode(signature_hex)
            .ok()
            .and_then(|bytes| Signature::from_slice(&bytes).ok())
            .ok_or_else(|| SecurityError::InvalidSignature {
                device_id: device_id.to_string(),
            })?;

        if record
            .public_key
            .verify(challenge.as_bytes(), &signature)
            .is_err()
        {
            log::warn!("authentication failed for {}", device_id);
            return Err(SecurityError::AuthenticationFailure {
                device_id: device_id.to_string(),
            });
        }

        record.last_used = now_ms;
        self.generate_session_key(device_id, now_ms)
    }

    /// Issue a new session for a registered device, replacing older ones
    pub fn generate_session_key(
        &mut self,
        device_id: &str,
        now_ms: u64,
    ) -> Result<SessionGrant, SecurityError> {
        let device_key = self
            .devices
            .get(device_id)
            .map(|record| record.key)
            .ok_or_else(|| SecurityError::DeviceNotRegistered {
                device_id: device_id.to_string(),
            })?;

        self.sessions
            .retain(|_, session| session.device_id != device_id);

        let session_id = crypto::random_hex(16);
        let key = crypto::random_key();
        let wrapped = crypto::seal(&device_key, &key, session_id.as_bytes())
            .map_err(|e| SecurityError::CryptoFailure(e.to_string()))?;
        let expires_at = now_ms + self.config.session_ttl_ms;

        self.sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                device_id: device_id.to_string(),
                key,
                created_at: now_ms,
                expires_at,
            },
        );

        Ok(SessionGrant {
            session_id,
            session_key: wrapped,
            expires_at,
        })
    }

    fn live_session(&self, session_id: &str, now_ms: u64) -> Result<&Session, SecurityError> {
        let session =
            self.sessions
                .get(session_id)
                .ok_or_else(|| SecurityError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
        if session.is_expired(now_ms) {
            return Err(SecurityError::SessionExpired {
                session_id: session_id.to_string(),
            });
        }
        Ok(session)
    }

    /// Encrypt under a session key, bound to the session id
    pub fn encrypt_message(
        &self,
        session_id: &str,
        plaintext: &[u8],
        now_ms: u64,
    ) -> Result<String, SecurityError> {
        let session = self.live_session(session_id, now_ms)?;
        crypto::seal(&session.key, plaintext, session_id.as_bytes())
            .map_err(|e| SecurityError::CryptoFailure(e.to_string()))
    }

    /// Decrypt a message produced by [`SessionSecurityManager::encrypt_message`]
    pub fn decrypt_message(
        &self,
        session_id: &str,
        ciphertext: &str,
        now_ms: u64,
    ) -> Result<Vec<u8>, SecurityError> {
        let session = self.live_session(session_id, now_ms)?;
        crypto::open(&session.key, ciphertext, session_id.as_bytes())
            .map_err(|e| SecurityError::CryptoFailure(e.to_string()))
    }

    /// Issue a challenge nonce, replacing any outstanding one
    pub fn generate_nonce(&mut self, device_id: &str, now_ms: u64) -> String {
        let nonce = crypto::random_hex(16);
        self.nonces.insert(
            device_id.to_string(),
            NonceRecord {
                device_id: device_id.to_string(),
                nonce: nonce.clone(),
                issued_at: now_ms,
                used: false,
            },
        );
        nonce
    }

    /// Consume a nonce; true exactly once per issued nonce within its TTL
    pub fn validate_nonce(&mut self, device_id: &str, nonce: &str, now_ms: u64) -> bool {
        let Some(record) = self.nonces.get_mut(device_id) else {
            return false;
        };
        if record.used || record.nonce != nonce {
            return false;
        }
        if now_ms.saturating_sub(record.issued_at) > self.config.nonce_ttl_ms {
            self.nonces.remove(device_id);
            return false;
        }
        record.used = true;
        true
    }

    /// Record device activity
    pub fn touch(&mut self, device_id: &str, now_ms: u64) {
        if let Some(record) = self.devices.get_mut(device_id) {
            record.last_used = now_ms;
        }
    }

    /// Drop key record, sessions and nonce of a device
    pub fn revoke_device(&mut self, device_id: &str) -> bool {
        let had_key = self.devices.remove(device_id).is_some();
        self.sessions
            .retain(|_, session| session.device_id != device_id);
        self.nonces.remove(device_id);
        had_key
    }

    /// Replace the master key, re-key active devices, purge expired state
    pub fn rotate_keys(&mut self, now_ms: u64) -> RotationReport {
        self.master_key = crypto::random_key();

        let window = self.config.activity_window_ms;
        let mut rekeyed_devices = 0;
        for record in self.devices.values_mut() {
            if now_ms.saturating_sub(record.last_used) < window {
                record.key = crypto::random_key();
                rekeyed_devices += 1;
            }
        }

        let sessions_before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now_ms));

        let nonce_ttl = self.config.nonce_ttl_ms;
        let nonces_before = self.nonces.len();
        self.nonces
            .retain(|_, nonce| !nonce.used && now_ms.saturating_sub(nonce.issued_at) <= nonce_ttl);

        let report = RotationReport {
            rekeyed_devices,
            sessions_purged: sessions_before - self.sessions.len(),
            nonces_purged: nonces_before - self.nonces.len(),
        };
        log::info!(
            "rotated keys: {} devices re-keyed, {} sessions and {} nonces purged",
            report.rekeyed_devices,
            report.sessions_purged,
            report.nonces_purged
        );
        report
    }

    /// Arm periodic rotation; first run one interval from `now_ms`
    pub fn start(&mut self, now_ms: u64) {
        if self.next_rotation.is_none() {
            self.next_rotation = Some(now_ms + self.config.key_rotation_interval_ms);
        }
    }

    /// Disarm periodic rotation
    pub fn stop(&mut self) {
        self.next_rotation = None;
    }

    /// Next rotation time, if armed
    pub fn next_deadline(&self) -> Option<u64> {
        self.next_rotation
    }

    /// Rotate when due
    pub fn poll(&mut self, now_ms: u64) -> Option<RotationReport> {
        let due = self.next_rotation?;
        if now_ms < due {
            return None;
        }
        let interval = self.config.key_rotation_interval_ms;
        // Skip missed periods instead of rotating repeatedly
        let next = due + interval;
        self.next_rotation = Some(if next <= now_ms { now_ms + interval } else { next });
        Some(self.rotate_keys(now_ms))
    }

    /// Key record of a device
    pub fn device(&self, device_id: &str) -> Option<&DeviceKeyRecord> {
        self.devices.get(device_id)
    }

    /// Whether a device has a key record
    pub fn is_registered(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Session by id
    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Registered device count
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Stored session count, expired ones included until purged
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    const NOW: u64 = 1_700_000_000_000;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn public_hex(key: &SigningKey) -> String {
        hex::encode(key.verifying_key().to_bytes())
    }

    fn sign(key: &SigningKey, challenge: &str) -> String {
        hex::encode(key.sign(challenge.as_bytes()).to_bytes())
    }

    fn registered() -> (SessionSecurityManager, SigningKey) {
        let mut manager = SessionSecurityManager::new(SecurityConfig::default());
        let key = signing_key();
        manager.register_device("D1", &public_hex(&key), NOW).unwrap();
        (manager, key)
    }

    #[test]
    fn test_register_wraps_device_key() {
        let (manager, _) = registered();
        let record = manager.device("D1").unwrap();
        assert_eq!(record.registered_at, NOW);

        let mut again = SessionSecurityManager::new(SecurityConfig::default());
        let sealed = again
            .register_device("D1", &public_hex(&signing_key()), NOW)
            .unwrap();
        let opened = crypto::open(&again.master_key, &sealed, b"D1").unwrap();
        assert_eq!(opened, again.devices["D1"].key.to_vec());
    }

    #[test]
    fn test_register_rejects_bad_key() {
        let mut manager = SessionSecurityManager::new(SecurityConfig::default());
        for bad in ["", "zz", "abcd", &"00".repeat(31)] {
            assert_eq!(
                manager.register_device("D1", bad, NOW),
                Err(SecurityError::InvalidPublicKey {
                    device_id: "D1".to_string()
                })
            );
        }
        assert!(!manager.is_registered("D1"));
    }

    #[test]
    fn test_authenticate_issues_session() {
        let (mut manager, key) = registered();
        let challenge = manager.generate_nonce("D1", NOW);
        let grant = manager
            .authenticate_device("D1", &challenge, &sign(&key, &challenge), NOW + 10)
            .unwrap();

        assert_eq!(grant.expires_at, NOW + 10 + 30 * 60 * 1000);
        assert_eq!(grant.session_id.len(), 32);
        let session = manager.session(&grant.session_id).unwrap();
        let device_key = manager.devices["D1"].key;
        let unwrapped =
            crypto::open(&device_key, &grant.session_key, grant.session_id.as_bytes()).unwrap();
        assert_eq!(unwrapped, session.key.to_vec());
        assert_eq!(manager.device("D1").unwrap().last_used, NOW + 10);
    }

    #[test]
    fn test_authenticate_failures() {
        let (mut manager, key) = registered();
        let other = SigningKey::from_bytes(&[9u8; 32]);

        assert_eq!(
            manager.authenticate_device("D1", "abc", &sign(&other, "abc"), NOW),
            Err(SecurityError::AuthenticationFailure {
                device_id: "D1".to_string()
            })
        );
        assert_eq!(
            manager.authenticate_device("D1", "abc", "not-hex", NOW),
            Err(SecurityError::InvalidSignature {
                device_id: "D1".to_string()
            })
        );
        assert_eq!(
            manager.authenticate_device("D2", "abc", &sign(&key, "abc"), NOW),
            Err(SecurityError::DeviceNotRegistered {
                device_id: "D2".to_string()
            })
        );
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_new_session_replaces_old() {
        let (mut manager, _) = registered();
        let first = manager.generate_session_key("D1", NOW).unwrap();
        let second = manager.generate_session_key("D1", NOW).unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert!(manager.session(&first.session_id).is_none());
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn test_session_encryption_lifecycle() {
        let (mut manager, _) = registered();
        let grant = manager.generate_session_key("D1", NOW).unwrap();
        let expires = grant.expires_at;

        let sealed = manager
            .encrypt_message(&grant.session_id, b"reading", expires - 1)
            .unwrap();
        assert_eq!(
            manager
                .decrypt_message(&grant.session_id, &sealed, expires - 1)
                .unwrap(),
            b"reading"
        );

        let expired = SecurityError::SessionExpired {
            session_id: grant.session_id.clone(),
        };
        assert_eq!(
            manager.encrypt_message(&grant.session_id, b"reading", expires),
            Err(expired.clone())
        );
        assert_eq!(
            manager.decrypt_message(&grant.session_id, &sealed, expires),
            Err(expired)
        );
        assert!(matches!(
            manager.encrypt_message("missing", b"x", NOW),
            Err(SecurityError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_ciphertext_bound_to_session() {
        let mut manager = SessionSecurityManager::new(SecurityConfig::default());
        manager
            .register_device("D1", &public_hex(&signing_key()), NOW)
            .unwrap();
        manager
            .register_device("D2", &public_hex(&SigningKey::from_bytes(&[3u8; 32])), NOW)
            .unwrap();
        let a = manager.generate_session_key("D1", NOW).unwrap();
        let b = manager.generate_session_key("D2", NOW).unwrap();

        let sealed = manager.encrypt_message(&a.session_id, b"x", NOW).unwrap();
        assert!(matches!(
            manager.decrypt_message(&b.session_id, &sealed, NOW),
            Err(SecurityError::CryptoFailure(_))
        ));
    }

    #[test]
    fn test_nonce_single_use() {
        let mut manager = SessionSecurityManager::new(SecurityConfig::default());
        let nonce = manager.generate_nonce("D1", NOW);

        assert!(!manager.validate_nonce("D1", "other", NOW));
        assert!(manager.validate_nonce("D1", &nonce, NOW));
        assert!(!manager.validate_nonce("D1", &nonce, NOW));
        assert!(!manager.validate_nonce("D2", &nonce, NOW));
    }

    #[test]
    fn test_nonce_expiry() {
        let mut manager = SessionSecurityManager::new(SecurityConfig::default());
        let nonce = manager.generate_nonce("D1", NOW);
        assert!(manager.validate_nonce("D1", &nonce, NOW + 300_000));

        let nonce = manager.generate_nonce("D1", NOW);
        assert!(!manager.validate_nonce("D1", &nonce, NOW + 300_001));
        // Expired nonces are dropped
        assert!(!manager.validate_nonce("D1", &nonce, NOW));
    }

    #[test]
    fn test_rotation_rekeys_active_devices() {
        let mut manager = SessionSecurityManager::new(SecurityConfig::default());
        manager
            .register_device("active", &public_hex(&signing_key()), NOW)
            .unwrap();
        manager
            .register_device("idle", &public_hex(&SigningKey::from_bytes(&[3u8; 32])), NOW)
            .unwrap();
        let later = NOW + 2 * 60 * 60 * 1000;
        manager.touch("active", later - 1000);

        let active_key = manager.devices["active"].key;
        let idle_key = manager.devices["idle"].key;
        let master = manager.master_key;
        manager.generate_session_key("idle", NOW).unwrap();
        manager.generate_nonce("idle", NOW);

        let report = manager.rotate_keys(later);
        assert_eq!(
            report,
            RotationReport {
                rekeyed_devices: 1,
                sessions_purged: 1,
                nonces_purged: 1
            }
        );
        assert_ne!(manager.master_key, master);
        assert_ne!(manager.devices["active"].key, active_key);
        assert_eq!(manager.devices["idle"].key, idle_key);
    }

    #[test]
    fn test_rotation_schedule() {
        let mut manager =
            SessionSecurityManager::new(SecurityConfig::new().with_rotation_interval(1000));
        assert_eq!(manager.poll(NOW), None);

        manager.start(NOW);
        assert_eq!(manager.next_deadline(), Some(NOW + 1000));
        assert_eq!(manager.poll(NOW + 999), None);
        assert!(manager.poll(NOW + 1000).is_some());
        assert_eq!(manager.next_deadline(), Some(NOW + 2000));

        // Long gap: one rotation, then back on a one-interval grid from now
        assert!(manager.poll(NOW + 10_500).is_some());
        assert_eq!(manager.next_deadline(), Some(NOW + 11_500));

        manager.stop();
        assert_eq!(manager.next_deadline(), None);
        assert_eq!(manager.poll(NOW + 20_000), None);
    }

    #[test]
    fn test_revoke_device() {
        let (mut manager, _) = registered();
        let grant = manager.generate_session_key("D1", NOW).unwrap();
        manager.generate_nonce("D1", NOW);

        assert!(manager.revoke_device("D1"));
        assert!(!manager.revoke_device("D1"));
        assert!(manager.session(&grant.session_id).is_none());
        assert_eq!(manager.nonces.len(), 0);
    }

    #[test]
    fn test_debug_hides_keys() {
        let (manager, _) = registered();
        let debug = format!("{:?}", manager.device("D1").unwrap());
        assert!(!debug.contains(&hex::encode(manager.devices["D1"].key)));
    }
}
