//! Pairwise session management (Proteus)
//!
//! Owns the lifecycle of pairwise encryption sessions: identity, prekey
//! generation, session creation, encrypt/decrypt, batched encryption, and
//! fingerprint reads. Only reachable through an open transaction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tracing::debug;

use crate::core_crypto::engine::CryptoEngine;
use crate::core_crypto::errors::{CryptoError, CryptoResult};
use crate::core_crypto::types::{PreKey, QualifiedClientId, LAST_RESORT_PREKEY_ID};
use crate::metrics::record_counter;

/// Outcome of a batched encryption: per-recipient results, never
/// all-or-nothing
#[derive(Debug, Default)]
pub struct BatchedEncryption {
    /// Successfully produced ciphertexts
    pub ciphertexts: HashMap<QualifiedClientId, Vec<u8>>,
    /// Recipients whose encryption failed, with the individual failure
    pub failures: HashMap<QualifiedClientId, CryptoError>,
}

impl BatchedEncryption {
    /// Whether every recipient was encrypted for
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pairwise-session sub-context of one open transaction
pub struct ProteusSessionManager<E: CryptoEngine> {
    engine: Arc<Mutex<E>>,
    /// Positive-existence cache, valid for the lifetime of this transaction
    known_sessions: StdMutex<HashSet<String>>,
}

impl<E: CryptoEngine> ProteusSessionManager<E> {
    pub(crate) fn new(engine: Arc<Mutex<E>>) -> Self {
        Self { engine, known_sessions: StdMutex::new(HashSet::new()) }
    }

    /// Generate `count` fresh prekeys starting at `from`.
    ///
    /// Ids already issued for this identity are skipped, so the returned
    /// ids never collide with earlier batches; `from` is the starting hint,
    /// not a guarantee of contiguity.
    pub async fn new_pre_keys(&self, from: u16, count: u16) -> CryptoResult<Vec<PreKey>> {
        let mut engine = self.engine.lock().await;
        let issued: HashSet<u16> = engine.proteus_issued_prekey_ids().await?.into_iter().collect();

        let mut ids = Vec::with_capacity(count as usize);
        let mut cursor = from as u32;
        let mut scanned = 0u32;
        while ids.len() < count as usize {
            if scanned > u16::MAX as u32 {
                return Err(CryptoError::Internal("prekey id space exhausted".to_string()));
            }
            let id = (cursor % LAST_RESORT_PREKEY_ID as u32) as u16;
            if !issued.contains(&id) && !ids.contains(&id) {
                ids.push(id);
            }
            cursor += 1;
            scanned += 1;
        }

        let mut prekeys = Vec::with_capacity(ids.len());
        for id in ids {
            let key = engine.proteus_new_prekey(id).await?;
            prekeys.push(PreKey { id, key });
        }
        record_counter("proteus.prekeys.created", prekeys.len() as u64);
        debug!(count = prekeys.len(), "generated prekeys");
        Ok(prekeys)
    }

    /// The reserved last-resort prekey; its id and bundle are stable across
    /// repeated calls
    pub async fn new_last_resort_pre_key(&self) -> CryptoResult<PreKey> {
        let key = self.engine.lock().await.proteus_last_resort_prekey().await?;
        Ok(PreKey { id: LAST_RESORT_PREKEY_ID, key })
    }

    /// Establish a new session from a peer's prekey. Fails when a session
    /// already exists; callers must delete it first.
    pub async fn create_session(
        &self,
        session_id: &QualifiedClientId,
        peer_pre_key: &PreKey,
    ) -> CryptoResult<()> {
        let mut engine = self.engine.lock().await;
        if engine.proteus_session_exists(session_id).await? {
            return Err(CryptoError::SessionAlreadyExists(session_id.to_string()));
        }
        engine.proteus_session_from_prekey(session_id, &peer_pre_key.key).await?;
        self.remember(session_id);
        record_counter("proteus.sessions.created", 1);
        debug!(session = %session_id, "session created");
        Ok(())
    }

    /// Whether a session exists; never mutates ratchet state
    pub async fn does_session_exist(&self, session_id: &QualifiedClientId) -> CryptoResult<bool> {
        if self.is_known(session_id) {
            return Ok(true);
        }
        let exists = self.engine.lock().await.proteus_session_exists(session_id).await?;
        if exists {
            self.remember(session_id);
        }
        Ok(exists)
    }

    /// Encrypt for an existing session
    pub async fn encrypt(
        &self,
        session_id: &QualifiedClientId,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let ciphertext =
            self.engine.lock().await.proteus_encrypt(session_id, plaintext).await?;
        record_counter("proteus.messages.encrypted", 1);
        Ok(ciphertext)
    }

    /// Decrypt, creating the session implicitly when the message embeds a
    /// prekey.
    ///
    /// The ratchet advances even on failures after partial processing;
    /// retrying the same ciphertext will report a duplicate.
    pub async fn decrypt(
        &self,
        session_id: &QualifiedClientId,
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let plaintext =
            self.engine.lock().await.proteus_decrypt(session_id, ciphertext).await?;
        self.remember(session_id);
        record_counter("proteus.messages.decrypted", 1);
        Ok(plaintext)
    }

    /// Encrypt the same plaintext independently for each session. One bad
    /// recipient never aborts the others; failures are reported per
    /// recipient in the result.
    pub async fn encrypt_batched(
        &self,
        session_ids: &[QualifiedClientId],
        plaintext: &[u8],
    ) -> CryptoResult<BatchedEncryption> {
        let mut engine = self.engine.lock().await;
        let mut batch = BatchedEncryption::default();
        for session_id in session_ids {
            match engine.proteus_encrypt(session_id, plaintext).await {
                Ok(ciphertext) => {
                    batch.ciphertexts.insert(session_id.clone(), ciphertext);
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    batch.failures.insert(session_id.clone(), error);
                }
            }
        }
        record_counter("proteus.messages.encrypted", batch.ciphertexts.len() as u64);
        if !batch.failures.is_empty() {
            debug!(failed = batch.failures.len(), "batched encryption partially failed");
        }
        Ok(batch)
    }

    /// Create a session from a prekey and encrypt in one step, for
    /// first-contact messages. No session is left behind if encryption
    /// fails.
    pub async fn encrypt_with_pre_key(
        &self,
        session_id: &QualifiedClientId,
        peer_pre_key: &PreKey,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let mut engine = self.engine.lock().await;
        if engine.proteus_session_exists(session_id).await? {
            return Err(CryptoError::SessionAlreadyExists(session_id.to_string()));
        }
        engine.proteus_session_from_prekey(session_id, &peer_pre_key.key).await?;
        match engine.proteus_encrypt(session_id, plaintext).await {
            Ok(ciphertext) => {
                self.remember(session_id);
                record_counter("proteus.sessions.created", 1);
                record_counter("proteus.messages.encrypted", 1);
                Ok(ciphertext)
            }
            Err(error) => {
                engine.proteus_session_delete(session_id).await?;
                Err(error)
            }
        }
    }

    /// Delete a session. Deleting a non-existent session is not an error.
    pub async fn delete_session(&self, session_id: &QualifiedClientId) -> CryptoResult<()> {
        self.engine.lock().await.proteus_session_delete(session_id).await?;
        self.forget(session_id);
        debug!(session = %session_id, "session deleted");
        Ok(())
    }

    /// Fingerprint of the local identity, for verification UI
    pub async fn local_fingerprint(&self) -> CryptoResult<String> {
        self.engine.lock().await.proteus_local_fingerprint().await
    }

    /// Fingerprint of the peer identity behind an existing session
    pub async fn remote_fingerprint(
        &self,
        session_id: &QualifiedClientId,
    ) -> CryptoResult<String> {
        self.engine.lock().await.proteus_remote_fingerprint(session_id).await
    }

    /// Fingerprint of the identity inside a prekey bundle, without a session
    pub async fn fingerprint_from_pre_key(&self, pre_key: &PreKey) -> CryptoResult<String> {
        self.engine.lock().await.proteus_prekey_fingerprint(&pre_key.key).await
    }

    fn is_known(&self, session_id: &QualifiedClientId) -> bool {
        self.known_sessions
            .lock()
            .map(|cache| cache.contains(&session_id.store_key()))
            .unwrap_or(false)
    }

    fn remember(&self, session_id: &QualifiedClientId) {
        if let Ok(mut cache) = self.known_sessions.lock() {
            cache.insert(session_id.store_key());
        }
    }

    fn forget(&self, session_id: &QualifiedClientId) {
        if let Ok(mut cache) = self.known_sessions.lock() {
            cache.remove(&session_id.store_key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::engine::MemoryCryptoEngine;
    use crate::core_crypto::types::{ClientId, QualifiedId};
    use proptest::prelude::*;

    fn client(name: &str) -> QualifiedClientId {
        QualifiedClientId::new(QualifiedId::random("example.com"), ClientId::new(name))
    }

    fn manager(name: &str) -> ProteusSessionManager<MemoryCryptoEngine> {
        ProteusSessionManager::new(Arc::new(Mutex::new(MemoryCryptoEngine::with_identity(
            client(name),
        ))))
    }

    #[tokio::test]
    async fn test_new_pre_keys_count_and_distinct_ids() {
        let alice = manager("alice");
        let prekeys = alice.new_pre_keys(0, 10).await.unwrap();
        assert_eq!(prekeys.len(), 10);

        let ids: HashSet<u16> = prekeys.iter().map(|pk| pk.id).collect();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_new_pre_keys_skip_already_issued() {
        let alice = manager("alice");
        let first = alice.new_pre_keys(0, 5).await.unwrap();
        let second = alice.new_pre_keys(0, 5).await.unwrap();

        let first_ids: HashSet<u16> = first.iter().map(|pk| pk.id).collect();
        let second_ids: HashSet<u16> = second.iter().map(|pk| pk.id).collect();
        assert!(first_ids.is_disjoint(&second_ids));
    }

    #[tokio::test]
    async fn test_last_resort_pre_key_stable() {
        let alice = manager("alice");
        let first = alice.new_last_resort_pre_key().await.unwrap();
        let second = alice.new_last_resort_pre_key().await.unwrap();

        assert_eq!(first.id, LAST_RESORT_PREKEY_ID);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_last_resort_requires_identity() {
        let bare = ProteusSessionManager::new(Arc::new(Mutex::new(MemoryCryptoEngine::new(
            client("bare"),
        ))));
        let result = bare.new_last_resort_pre_key().await;
        assert!(matches!(result, Err(CryptoError::IdentityMissing(_))));
    }

    #[tokio::test]
    async fn test_create_session_twice_fails() {
        let alice = manager("alice");
        let bob = manager("bob");
        let bob_id = client("bob-device");

        let prekeys = bob.new_pre_keys(0, 2).await.unwrap();
        alice.create_session(&bob_id, &prekeys[0]).await.unwrap();

        let result = alice.create_session(&bob_id, &prekeys[1]).await;
        assert!(matches!(result, Err(CryptoError::SessionAlreadyExists(_))));

        alice.delete_session(&bob_id).await.unwrap();
        alice.create_session(&bob_id, &prekeys[1]).await.unwrap();
    }

    #[tokio::test]
    async fn test_roundtrip_between_peers() {
        let alice_id = client("alice-device");
        let bob_id = client("bob-device");
        let alice = ProteusSessionManager::new(Arc::new(Mutex::new(
            MemoryCryptoEngine::with_identity(alice_id.clone()),
        )));
        let bob = ProteusSessionManager::new(Arc::new(Mutex::new(
            MemoryCryptoEngine::with_identity(bob_id.clone()),
        )));

        let prekeys = bob.new_pre_keys(0, 1).await.unwrap();
        let ciphertext =
            alice.encrypt_with_pre_key(&bob_id, &prekeys[0], b"first contact").await.unwrap();

        assert!(!bob.does_session_exist(&alice_id).await.unwrap());
        let plaintext = bob.decrypt(&alice_id, &ciphertext).await.unwrap();
        assert_eq!(plaintext, b"first contact");
        assert!(bob.does_session_exist(&alice_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_encrypt_batched_isolates_failures() {
        let alice = manager("alice");
        let bob = manager("bob");

        let mut sessions = Vec::new();
        for i in 0..4u16 {
            let id = client(&format!("bob-device-{i}"));
            let prekeys = bob.new_pre_keys(i * 10, 1).await.unwrap();
            alice.create_session(&id, &prekeys[0]).await.unwrap();
            sessions.push(id);
        }
        // One recipient without a session
        let ghost = client("ghost-device");
        sessions.push(ghost.clone());

        let batch = alice.encrypt_batched(&sessions, b"fan out").await.unwrap();
        assert_eq!(batch.ciphertexts.len(), 4);
        assert_eq!(batch.failures.len(), 1);
        assert!(matches!(
            batch.failures.get(&ghost),
            Some(CryptoError::SessionNotFound(_))
        ));
        assert!(!batch.is_complete());
    }

    #[tokio::test]
    async fn test_delete_session_is_idempotent() {
        let alice = manager("alice");
        let ghost = client("ghost-device");
        alice.delete_session(&ghost).await.unwrap();
        alice.delete_session(&ghost).await.unwrap();
    }

    #[tokio::test]
    async fn test_fingerprints() {
        let alice = manager("alice");
        let bob = manager("bob");
        let bob_id = client("bob-device");

        let local = alice.local_fingerprint().await.unwrap();
        assert_eq!(local.len(), 64);

        let prekeys = bob.new_pre_keys(0, 1).await.unwrap();
        let from_prekey = alice.fingerprint_from_pre_key(&prekeys[0]).await.unwrap();
        assert_eq!(from_prekey, bob.local_fingerprint().await.unwrap());

        alice.create_session(&bob_id, &prekeys[0]).await.unwrap();
        let remote = alice.remote_fingerprint(&bob_id).await.unwrap();
        assert_eq!(remote, bob.local_fingerprint().await.unwrap());

        let ghost = client("ghost-device");
        let result = alice.remote_fingerprint(&ghost).await;
        assert!(matches!(result, Err(CryptoError::SessionNotFound(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_prekey_ids_never_collide(batches in prop::collection::vec((0u16..500, 1u16..30), 1..6)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async move {
                let alice = manager("alice");
                let mut seen: HashSet<u16> = HashSet::new();
                for (from, count) in batches {
                    let prekeys = alice.new_pre_keys(from, count).await.unwrap();
                    prop_assert_eq!(prekeys.len(), count as usize);
                    for prekey in prekeys {
                        prop_assert!(seen.insert(prekey.id), "id {} issued twice", prekey.id);
                    }
                }
                Ok(())
            })?;
        }
    }
}
