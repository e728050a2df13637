//! In-memory crypto engine
//!
//! A complete engine implementation holding all state in process memory.
//! Ratchet and group bookkeeping are intentionally simple; the key material
//! handling uses real primitives (X25519, Ed25519, HKDF-SHA256,
//! ChaCha20-Poly1305) so that round-trips between two engines exercise the
//! same code paths a production engine would.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core_crypto::errors::{CryptoError, CryptoResult};
use crate::core_crypto::types::{
    ApplicationMessage, CommitBundle, CommitMessage, GroupId, QualifiedClientId, WelcomeMessage,
    LAST_RESORT_PREKEY_ID,
};

use super::CryptoEngine;

/// Most messages a receiving chain may be stepped forward in one decrypt
const MAX_COUNTER_SKIP: u32 = 1000;

const PROTEUS_ROOT_INFO: &[u8] = b"pangolin-proteus-root";
const PROTEUS_INITIATOR_INFO: &[u8] = b"pangolin-proteus-initiator";
const PROTEUS_RESPONDER_INFO: &[u8] = b"pangolin-proteus-responder";
const PROTEUS_MESSAGE_INFO: &[u8] = b"pangolin-proteus-msg";
const PROTEUS_CHAIN_INFO: &[u8] = b"pangolin-proteus-chain";
const MLS_EPOCH_INFO: &[u8] = b"pangolin-mls-epoch";
const MLS_EXTERNAL_INFO: &[u8] = b"pangolin-mls-external";
const MLS_ADVANCE_INFO: &[u8] = b"pangolin-mls-advance";
const MLS_WELCOME_INFO: &[u8] = b"pangolin-mls-welcome";

/// 32 bytes of secret key material, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecretBytes([u8; 32]);

impl SecretBytes {
    fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

#[derive(Clone)]
struct IdentityKeys {
    /// Ed25519 seed for signing and fingerprints
    signing: SecretBytes,
    /// X25519 static secret for key agreement
    exchange: SecretBytes,
}

impl IdentityKeys {
    fn generate() -> Self {
        Self { signing: SecretBytes::random(), exchange: SecretBytes::random() }
    }

    fn signing_key(&self) -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(&self.signing.0)
    }

    fn public_signing(&self) -> Vec<u8> {
        self.signing_key().verifying_key().to_bytes().to_vec()
    }
}

#[derive(Clone)]
struct PreKeyRecord {
    secret: SecretBytes,
    /// Encoded public bundle; kept so repeated reads return identical bytes
    bundle: Vec<u8>,
}

#[derive(Clone)]
struct ChainState {
    key: SecretBytes,
    next: u32,
}

#[derive(Clone, Serialize, Deserialize)]
struct PendingPreKey {
    prekey_id: u16,
    base_key: Vec<u8>,
    identity_key: Vec<u8>,
}

#[derive(Clone)]
struct SessionState {
    send: ChainState,
    recv: ChainState,
    remote_identity: Vec<u8>,
    /// Set while this side has never received a message; makes outgoing
    /// messages self-establishing on the peer
    pending_prekey: Option<PendingPreKey>,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) enum ProposalData {
    Add { member: QualifiedClientId, init_key: Vec<u8> },
    Remove { member: QualifiedClientId },
}

#[derive(Clone)]
struct PendingCommit {
    /// Epoch the group moves to on acceptance
    epoch: u64,
    adds: Vec<(QualifiedClientId, Vec<u8>)>,
    removes: Vec<QualifiedClientId>,
    next_secret: SecretBytes,
}

#[derive(Clone)]
struct GroupState {
    epoch: u64,
    secret: SecretBytes,
    members: BTreeSet<QualifiedClientId>,
    pending_proposals: Vec<ProposalData>,
    pending_commit: Option<PendingCommit>,
}

#[derive(Clone, Default)]
struct EngineState {
    identity: Option<IdentityKeys>,
    prekeys: BTreeMap<u16, PreKeyRecord>,
    sessions: HashMap<String, SessionState>,
    groups: HashMap<GroupId, GroupState>,
    /// init-key public bytes -> init-key secret, for welcomes addressed to us
    key_packages: HashMap<Vec<u8>, SecretBytes>,
}

/// Opaque rollback token for [`MemoryCryptoEngine`]
pub struct EngineSnapshot(EngineState);

// Wire structures internal to this engine. The orchestration layer treats
// these payloads as opaque bytes.

#[derive(Serialize, Deserialize)]
struct PreKeyBundleData {
    id: u16,
    exchange_key: Vec<u8>,
    identity_key: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RatchetMessage {
    counter: u32,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
enum ProteusEnvelope {
    PreKey {
        prekey_id: u16,
        base_key: Vec<u8>,
        identity_key: Vec<u8>,
        message: RatchetMessage,
    },
    Ratchet(RatchetMessage),
}

#[derive(Serialize, Deserialize)]
struct SealedPayload {
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct KeyPackageData {
    member: QualifiedClientId,
    init_key: Vec<u8>,
    signature: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
enum MembershipOp {
    Add { member: QualifiedClientId, init_key: Vec<u8> },
    Remove { member: QualifiedClientId },
    Update,
    ExternalJoin { member: QualifiedClientId },
}

#[derive(Serialize, Deserialize)]
struct CommitPayload {
    ops: Vec<MembershipOp>,
}

#[derive(Serialize, Deserialize)]
struct WelcomeEntry {
    init_key: Vec<u8>,
    eph_key: Vec<u8>,
    nonce: Vec<u8>,
    sealed_secret: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WelcomePayload {
    members: Vec<QualifiedClientId>,
    entries: Vec<WelcomeEntry>,
}

#[derive(Serialize, Deserialize)]
struct GroupInfoData {
    group_id: GroupId,
    epoch: u64,
    members: Vec<QualifiedClientId>,
    external_secret: Vec<u8>,
}

/// In-memory implementation of [`CryptoEngine`]
pub struct MemoryCryptoEngine {
    client: QualifiedClientId,
    state: EngineState,
}

impl MemoryCryptoEngine {
    /// Create an engine with no identity yet
    pub fn new(client: QualifiedClientId) -> Self {
        Self { client, state: EngineState::default() }
    }

    /// Create an engine and initialize its identity immediately
    pub fn with_identity(client: QualifiedClientId) -> Self {
        let mut engine = Self::new(client);
        engine.state.identity = Some(IdentityKeys::generate());
        engine
    }

    /// The local client this engine belongs to
    pub fn client_id(&self) -> &QualifiedClientId {
        &self.client
    }

    /// Encode an add proposal referencing a peer's key package, as a remote
    /// member would put it on the wire
    pub(crate) fn encode_add_proposal(key_package: &[u8]) -> CryptoResult<Vec<u8>> {
        let kp = parse_key_package(key_package)?;
        Ok(bincode::serialize(&ProposalData::Add { member: kp.member, init_key: kp.init_key })?)
    }

    /// Encode a remove proposal for a member
    pub(crate) fn encode_remove_proposal(member: &QualifiedClientId) -> CryptoResult<Vec<u8>> {
        Ok(bincode::serialize(&ProposalData::Remove { member: member.clone() })?)
    }

    fn identity(&self) -> CryptoResult<&IdentityKeys> {
        self.state
            .identity
            .as_ref()
            .ok_or_else(|| CryptoError::IdentityMissing("no local identity".to_string()))
    }

    fn session(&self, id: &QualifiedClientId) -> CryptoResult<&SessionState> {
        self.state
            .sessions
            .get(&id.store_key())
            .ok_or_else(|| CryptoError::SessionNotFound(id.to_string()))
    }

    fn group(&self, id: &GroupId) -> CryptoResult<&GroupState> {
        self.state
            .groups
            .get(id)
            .ok_or_else(|| CryptoError::GroupNotFound(id.to_string()))
    }

    fn group_mut(&mut self, id: &GroupId) -> CryptoResult<&mut GroupState> {
        self.state
            .groups
            .get_mut(id)
            .ok_or_else(|| CryptoError::GroupNotFound(id.to_string()))
    }

    fn make_prekey(&mut self, id: u16) -> CryptoResult<Vec<u8>> {
        let identity = self.identity()?;
        let secret = SecretBytes::random();
        let public = PublicKey::from(&StaticSecret::from(secret.0));
        let bundle = bincode::serialize(&PreKeyBundleData {
            id,
            exchange_key: public.as_bytes().to_vec(),
            identity_key: identity.public_signing(),
        })?;
        self.state
            .prekeys
            .insert(id, PreKeyRecord { secret, bundle: bundle.clone() });
        Ok(bundle)
    }

    fn create_session_state(
        &mut self,
        id: &QualifiedClientId,
        root: [u8; 32],
        initiator: bool,
        remote_identity: Vec<u8>,
        pending_prekey: Option<PendingPreKey>,
    ) -> CryptoResult<()> {
        let initiator_chain = derive_key(&root, PROTEUS_INITIATOR_INFO)?;
        let responder_chain = derive_key(&root, PROTEUS_RESPONDER_INFO)?;
        let (send, recv) = if initiator {
            (initiator_chain, responder_chain)
        } else {
            (responder_chain, initiator_chain)
        };
        self.state.sessions.insert(
            id.store_key(),
            SessionState {
                send: ChainState { key: SecretBytes(send), next: 0 },
                recv: ChainState { key: SecretBytes(recv), next: 0 },
                remote_identity,
                pending_prekey,
            },
        );
        Ok(())
    }

    fn decrypt_ratchet(
        &mut self,
        id: &QualifiedClientId,
        message: &RatchetMessage,
    ) -> CryptoResult<Vec<u8>> {
        let session = self
            .state
            .sessions
            .get_mut(&id.store_key())
            .ok_or_else(|| CryptoError::SessionNotFound(id.to_string()))?;

        if message.counter < session.recv.next {
            return Err(CryptoError::DuplicateMessage(format!(
                "counter {} already processed for {}",
                message.counter, id
            )));
        }
        if message.counter - session.recv.next > MAX_COUNTER_SKIP {
            return Err(CryptoError::MalformedCiphertext(format!(
                "counter {} too far ahead of {}",
                message.counter, session.recv.next
            )));
        }

        // Step the chain up to and including the message counter. The chain
        // stays advanced even if authentication fails below; retrying the
        // same ciphertext is a protocol violation.
        let mut chain = session.recv.key.0;
        let mut message_key = derive_key(&chain, PROTEUS_MESSAGE_INFO)?;
        for _ in session.recv.next..message.counter {
            chain = derive_key(&chain, PROTEUS_CHAIN_INFO)?;
            message_key = derive_key(&chain, PROTEUS_MESSAGE_INFO)?;
        }
        session.recv.key = SecretBytes(derive_key(&chain, PROTEUS_CHAIN_INFO)?);
        session.recv.next = message.counter + 1;

        // Both sides bind the counter into the AEAD
        let plaintext = open(
            &message_key,
            &message.counter.to_be_bytes(),
            &message.nonce,
            &message.ciphertext,
        )?;
        session.pending_prekey = None;
        Ok(plaintext)
    }

    fn stage_commit(
        &mut self,
        group_id: &GroupId,
        ops: Vec<MembershipOp>,
        adds: Vec<(QualifiedClientId, Vec<u8>)>,
        removes: Vec<QualifiedClientId>,
    ) -> CryptoResult<CommitBundle> {
        let group = self.group_mut(group_id)?;
        if group.pending_commit.is_some() {
            return Err(CryptoError::PendingCommitExists(group_id.to_string()));
        }
        for member in &removes {
            if !group.members.contains(member) {
                return Err(CryptoError::MemberNotFound(member.to_string()));
            }
        }
        for (member, _) in &adds {
            if group.members.contains(member) {
                return Err(CryptoError::Internal(format!("{member} already a member")));
            }
        }

        let staged_epoch = group.epoch + 1;
        let next_secret = derive_key(&group.secret.0, MLS_EPOCH_INFO)?;

        let mut post_members = group.members.clone();
        for (member, _) in &adds {
            post_members.insert(member.clone());
        }
        for member in &removes {
            post_members.remove(member);
        }

        let commit = CommitMessage {
            group_id: group_id.clone(),
            epoch: staged_epoch,
            payload: bincode::serialize(&CommitPayload { ops })?,
        };

        let welcome = if adds.is_empty() {
            None
        } else {
            let mut entries = Vec::with_capacity(adds.len());
            for (_, init_key) in &adds {
                entries.push(seal_welcome_entry(init_key, &next_secret)?);
            }
            Some(WelcomeMessage {
                group_id: group_id.clone(),
                epoch: staged_epoch,
                payload: bincode::serialize(&WelcomePayload {
                    members: post_members.iter().cloned().collect(),
                    entries,
                })?,
            })
        };

        let group_info = encode_group_info(group_id, staged_epoch, &post_members, &next_secret)?;

        let group = self.group_mut(group_id)?;
        group.pending_commit = Some(PendingCommit {
            epoch: staged_epoch,
            adds,
            removes,
            next_secret: SecretBytes(next_secret),
        });

        Ok(CommitBundle { commit, welcome, group_info })
    }
}

fn derive_key(ikm: &[u8], info: &[u8]) -> CryptoResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::Internal(format!("hkdf: {e}")))?;
    Ok(okm)
}

fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Internal(format!("aead seal: {e}")))?;
    Ok((nonce.to_vec(), ciphertext))
}

fn open(key: &[u8; 32], aad: &[u8], nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if nonce.len() != 12 {
        return Err(CryptoError::MalformedCiphertext("bad nonce length".to_string()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::MalformedCiphertext("authentication failed".to_string()))
}

fn fingerprint(key: &[u8]) -> String {
    hex::encode(Sha256::digest(key))
}

fn exchange_public(bytes: &[u8]) -> CryptoResult<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedPreKeyBundle("bad key length".to_string()))?;
    Ok(PublicKey::from(arr))
}

fn parse_key_package(bytes: &[u8]) -> CryptoResult<KeyPackageData> {
    let kp: KeyPackageData = bincode::deserialize(bytes)
        .map_err(|e| CryptoError::MalformedKeyPackage(e.to_string()))?;
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(
        kp.member_signing_key()
            .ok_or_else(|| CryptoError::MalformedKeyPackage("missing signing key".to_string()))?,
    )
    .map_err(|e| CryptoError::MalformedKeyPackage(e.to_string()))?;
    let signature = ed25519_dalek::Signature::try_from(kp.signature.as_slice())
        .map_err(|e| CryptoError::MalformedKeyPackage(e.to_string()))?;
    verifying
        .verify(&kp.signed_content(), &signature)
        .map_err(|_| CryptoError::MalformedKeyPackage("signature check failed".to_string()))?;
    Ok(kp)
}

impl KeyPackageData {
    fn signed_content(&self) -> Vec<u8> {
        let mut content = self.member.store_key().into_bytes();
        content.extend_from_slice(&self.init_key);
        content
    }

    fn member_signing_key(&self) -> Option<&[u8; 32]> {
        // The signing key rides in front of the init key material
        self.init_key.get(32..64)?.try_into().ok()
    }
}

fn seal_welcome_entry(init_key: &[u8], next_secret: &[u8; 32]) -> CryptoResult<WelcomeEntry> {
    let recipient = exchange_public(init_key.get(..32).ok_or_else(|| {
        CryptoError::MalformedKeyPackage("init key too short".to_string())
    })?)?;
    let eph = StaticSecret::from(SecretBytes::random().0);
    let eph_pub = PublicKey::from(&eph);
    let shared = eph.diffie_hellman(&recipient);
    let wrap_key = derive_key(shared.as_bytes(), MLS_WELCOME_INFO)?;
    let (nonce, sealed_secret) = seal(&wrap_key, &[], next_secret)?;
    Ok(WelcomeEntry {
        init_key: init_key.to_vec(),
        eph_key: eph_pub.as_bytes().to_vec(),
        nonce,
        sealed_secret,
    })
}

fn encode_group_info(
    group_id: &GroupId,
    epoch: u64,
    members: &BTreeSet<QualifiedClientId>,
    secret: &[u8; 32],
) -> CryptoResult<Vec<u8>> {
    Ok(bincode::serialize(&GroupInfoData {
        group_id: group_id.clone(),
        epoch,
        members: members.iter().cloned().collect(),
        external_secret: derive_key(secret, MLS_EXTERNAL_INFO)?.to_vec(),
    })?)
}

#[async_trait]
impl CryptoEngine for MemoryCryptoEngine {
    type Snapshot = EngineSnapshot;

    async fn init_identity(&mut self) -> CryptoResult<()> {
        if self.state.identity.is_none() {
            self.state.identity = Some(IdentityKeys::generate());
        }
        Ok(())
    }

    async fn has_identity(&self) -> bool {
        self.state.identity.is_some()
    }

    async fn proteus_new_prekey(&mut self, id: u16) -> CryptoResult<Vec<u8>> {
        if id == LAST_RESORT_PREKEY_ID {
            return self.proteus_last_resort_prekey().await;
        }
        self.make_prekey(id)
    }

    async fn proteus_issued_prekey_ids(&self) -> CryptoResult<Vec<u16>> {
        Ok(self.state.prekeys.keys().copied().collect())
    }

    async fn proteus_last_resort_prekey(&mut self) -> CryptoResult<Vec<u8>> {
        self.identity()?;
        if let Some(record) = self.state.prekeys.get(&LAST_RESORT_PREKEY_ID) {
            return Ok(record.bundle.clone());
        }
        self.make_prekey(LAST_RESORT_PREKEY_ID)
    }

    async fn proteus_session_exists(&self, session: &QualifiedClientId) -> CryptoResult<bool> {
        Ok(self.state.sessions.contains_key(&session.store_key()))
    }

    async fn proteus_session_from_prekey(
        &mut self,
        session: &QualifiedClientId,
        prekey: &[u8],
    ) -> CryptoResult<()> {
        self.identity()?;
        if self.state.sessions.contains_key(&session.store_key()) {
            return Err(CryptoError::SessionAlreadyExists(session.to_string()));
        }
        let bundle: PreKeyBundleData = bincode::deserialize(prekey)
            .map_err(|e| CryptoError::MalformedPreKeyBundle(e.to_string()))?;
        let peer_key = exchange_public(&bundle.exchange_key)?;

        let base = StaticSecret::from(SecretBytes::random().0);
        let base_pub = PublicKey::from(&base);
        let shared = base.diffie_hellman(&peer_key);
        let root = derive_key(shared.as_bytes(), PROTEUS_ROOT_INFO)?;

        let identity_key = self.identity()?.public_signing();
        self.create_session_state(
            session,
            root,
            true,
            bundle.identity_key,
            Some(PendingPreKey {
                prekey_id: bundle.id,
                base_key: base_pub.as_bytes().to_vec(),
                identity_key,
            }),
        )
    }

    async fn proteus_session_delete(&mut self, session: &QualifiedClientId) -> CryptoResult<()> {
        self.state.sessions.remove(&session.store_key());
        Ok(())
    }

    async fn proteus_encrypt(
        &mut self,
        session: &QualifiedClientId,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let state = self
            .state
            .sessions
            .get_mut(&session.store_key())
            .ok_or_else(|| CryptoError::SessionNotFound(session.to_string()))?;

        let message_key = derive_key(&state.send.key.0, PROTEUS_MESSAGE_INFO)?;
        let counter = state.send.next;
        state.send.key = SecretBytes(derive_key(&state.send.key.0, PROTEUS_CHAIN_INFO)?);
        state.send.next += 1;

        let (nonce, ciphertext) = seal(&message_key, &counter.to_be_bytes(), plaintext)?;
        let message = RatchetMessage { counter, nonce, ciphertext };
        let envelope = match &state.pending_prekey {
            Some(pending) => ProteusEnvelope::PreKey {
                prekey_id: pending.prekey_id,
                base_key: pending.base_key.clone(),
                identity_key: pending.identity_key.clone(),
                message,
            },
            None => ProteusEnvelope::Ratchet(message),
        };
        Ok(bincode::serialize(&envelope)?)
    }

    async fn proteus_decrypt(
        &mut self,
        session: &QualifiedClientId,
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let envelope: ProteusEnvelope = bincode::deserialize(ciphertext)
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;
        match envelope {
            ProteusEnvelope::PreKey { prekey_id, base_key, identity_key, message } => {
                if !self.state.sessions.contains_key(&session.store_key()) {
                    let record = self.state.prekeys.get(&prekey_id).ok_or_else(|| {
                        CryptoError::MalformedCiphertext(format!("unknown prekey {prekey_id}"))
                    })?;
                    let secret = StaticSecret::from(record.secret.0);
                    let shared = secret.diffie_hellman(&exchange_public(&base_key)?);
                    let root = derive_key(shared.as_bytes(), PROTEUS_ROOT_INFO)?;
                    self.create_session_state(session, root, false, identity_key, None)?;
                }
                self.decrypt_ratchet(session, &message)
            }
            ProteusEnvelope::Ratchet(message) => self.decrypt_ratchet(session, &message),
        }
    }

    async fn proteus_local_fingerprint(&self) -> CryptoResult<String> {
        Ok(fingerprint(&self.identity()?.public_signing()))
    }

    async fn proteus_remote_fingerprint(
        &self,
        session: &QualifiedClientId,
    ) -> CryptoResult<String> {
        Ok(fingerprint(&self.session(session)?.remote_identity))
    }

    async fn proteus_prekey_fingerprint(&self, prekey: &[u8]) -> CryptoResult<String> {
        let bundle: PreKeyBundleData = bincode::deserialize(prekey)
            .map_err(|e| CryptoError::MalformedPreKeyBundle(e.to_string()))?;
        Ok(fingerprint(&bundle.identity_key))
    }

    async fn mls_generate_key_packages(&mut self, amount: usize) -> CryptoResult<Vec<Vec<u8>>> {
        let identity = self.identity()?;
        let signing_key = identity.signing_key();
        let signing_public = identity.public_signing();

        let mut packages = Vec::with_capacity(amount);
        for _ in 0..amount {
            let secret = SecretBytes::random();
            let exchange_pub = PublicKey::from(&StaticSecret::from(secret.0));

            // init key = exchange public || signing public
            let mut init_key = exchange_pub.as_bytes().to_vec();
            init_key.extend_from_slice(&signing_public);

            let kp = KeyPackageData {
                member: self.client.clone(),
                init_key: init_key.clone(),
                signature: Vec::new(),
            };
            let signature = signing_key.sign(&kp.signed_content());
            let kp = KeyPackageData { signature: signature.to_bytes().to_vec(), ..kp };

            self.state.key_packages.insert(init_key, secret);
            packages.push(bincode::serialize(&kp)?);
        }
        Ok(packages)
    }

    async fn mls_valid_key_package_count(&self) -> CryptoResult<u64> {
        Ok(self.state.key_packages.len() as u64)
    }

    async fn mls_create_group(&mut self, group: &GroupId) -> CryptoResult<()> {
        self.identity()?;
        if self.state.groups.contains_key(group) {
            return Err(CryptoError::GroupAlreadyExists(group.to_string()));
        }
        let mut members = BTreeSet::new();
        members.insert(self.client.clone());
        self.state.groups.insert(
            group.clone(),
            GroupState {
                epoch: 0,
                secret: SecretBytes::random(),
                members,
                pending_proposals: Vec::new(),
                pending_commit: None,
            },
        );
        Ok(())
    }

    async fn mls_group_exists(&self, group: &GroupId) -> CryptoResult<bool> {
        Ok(self.state.groups.contains_key(group))
    }

    async fn mls_group_epoch(&self, group: &GroupId) -> CryptoResult<u64> {
        Ok(self.group(group)?.epoch)
    }

    async fn mls_group_members(
        &self,
        group: &GroupId,
    ) -> CryptoResult<Vec<QualifiedClientId>> {
        Ok(self.group(group)?.members.iter().cloned().collect())
    }

    async fn mls_stage_add(
        &mut self,
        group: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> CryptoResult<CommitBundle> {
        let mut ops = Vec::with_capacity(key_packages.len());
        let mut adds = Vec::with_capacity(key_packages.len());
        for bytes in key_packages {
            let kp = parse_key_package(bytes)?;
            ops.push(MembershipOp::Add {
                member: kp.member.clone(),
                init_key: kp.init_key.clone(),
            });
            adds.push((kp.member, kp.init_key));
        }
        self.stage_commit(group, ops, adds, Vec::new())
    }

    async fn mls_stage_remove(
        &mut self,
        group: &GroupId,
        members: &[QualifiedClientId],
    ) -> CryptoResult<CommitBundle> {
        let ops = members
            .iter()
            .map(|member| MembershipOp::Remove { member: member.clone() })
            .collect();
        self.stage_commit(group, ops, Vec::new(), members.to_vec())
    }

    async fn mls_stage_update(&mut self, group: &GroupId) -> CryptoResult<CommitBundle> {
        self.stage_commit(group, vec![MembershipOp::Update], Vec::new(), Vec::new())
    }

    async fn mls_buffer_proposal(
        &mut self,
        group: &GroupId,
        payload: &[u8],
    ) -> CryptoResult<()> {
        let proposal: ProposalData = bincode::deserialize(payload)
            .map_err(|e| CryptoError::MalformedCiphertext(format!("proposal: {e}")))?;
        self.group_mut(group)?.pending_proposals.push(proposal);
        Ok(())
    }

    async fn mls_pending_proposal_count(&self, group: &GroupId) -> CryptoResult<usize> {
        Ok(self.group(group)?.pending_proposals.len())
    }

    async fn mls_stage_pending_proposals(
        &mut self,
        group: &GroupId,
    ) -> CryptoResult<CommitBundle> {
        let proposals = self.group(group)?.pending_proposals.clone();
        if proposals.is_empty() {
            return Err(CryptoError::Internal("no pending proposals".to_string()));
        }
        let mut ops = Vec::with_capacity(proposals.len());
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        for proposal in proposals {
            match proposal {
                ProposalData::Add { member, init_key } => {
                    ops.push(MembershipOp::Add {
                        member: member.clone(),
                        init_key: init_key.clone(),
                    });
                    adds.push((member, init_key));
                }
                ProposalData::Remove { member } => {
                    ops.push(MembershipOp::Remove { member: member.clone() });
                    removes.push(member);
                }
            }
        }
        self.stage_commit(group, ops, adds, removes)
    }

    async fn mls_has_pending_commit(&self, group: &GroupId) -> CryptoResult<bool> {
        Ok(self.group(group)?.pending_commit.is_some())
    }

    async fn mls_commit_accepted(&mut self, group: &GroupId) -> CryptoResult<u64> {
        let group_key = group.to_string();
        let state = self.group_mut(group)?;
        let pending = state
            .pending_commit
            .take()
            .ok_or(CryptoError::NoPendingCommit(group_key))?;
        for (member, _) in pending.adds {
            state.members.insert(member);
        }
        for member in pending.removes {
            state.members.remove(&member);
        }
        state.epoch = pending.epoch;
        state.secret = pending.next_secret.clone();
        state.pending_proposals.clear();
        Ok(state.epoch)
    }

    async fn mls_clear_pending_commit(&mut self, group: &GroupId) -> CryptoResult<()> {
        self.group_mut(group)?.pending_commit = None;
        Ok(())
    }

    async fn mls_process_welcome(&mut self, welcome: &WelcomeMessage) -> CryptoResult<GroupId> {
        self.identity()?;
        if self.state.groups.contains_key(&welcome.group_id) {
            return Err(CryptoError::OrphanWelcome(format!(
                "group {} already exists",
                welcome.group_id
            )));
        }
        let payload: WelcomePayload = bincode::deserialize(&welcome.payload)
            .map_err(|e| CryptoError::OrphanWelcome(e.to_string()))?;

        let mut unsealed: Option<([u8; 32], Vec<u8>)> = None;
        for entry in &payload.entries {
            let Some(init_secret) = self.state.key_packages.get(&entry.init_key) else {
                continue;
            };
            let secret = StaticSecret::from(init_secret.0);
            let shared = secret.diffie_hellman(&exchange_public(entry.eph_key.get(..32).ok_or_else(
                || CryptoError::OrphanWelcome("bad ephemeral key".to_string()),
            )?)?);
            let wrap_key = derive_key(shared.as_bytes(), MLS_WELCOME_INFO)?;
            let group_secret = open(&wrap_key, &[], &entry.nonce, &entry.sealed_secret)
                .map_err(|_| CryptoError::OrphanWelcome("secret unseal failed".to_string()))?;
            let group_secret: [u8; 32] = group_secret
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::OrphanWelcome("bad group secret".to_string()))?;
            unsealed = Some((group_secret, entry.init_key.clone()));
            break;
        }

        let Some((group_secret, consumed_init_key)) = unsealed else {
            return Err(CryptoError::OrphanWelcome(
                "welcome not addressed to any of our key packages".to_string(),
            ));
        };
        self.state.key_packages.remove(&consumed_init_key);

        self.state.groups.insert(
            welcome.group_id.clone(),
            GroupState {
                epoch: welcome.epoch,
                secret: SecretBytes(group_secret),
                members: payload.members.into_iter().collect(),
                pending_proposals: Vec::new(),
                pending_commit: None,
            },
        );
        Ok(welcome.group_id.clone())
    }

    async fn mls_join_by_external_commit(
        &mut self,
        group_info: &[u8],
    ) -> CryptoResult<(GroupId, CommitBundle)> {
        self.identity()?;
        let info: GroupInfoData = bincode::deserialize(group_info)
            .map_err(|e| CryptoError::Serialization(format!("group info: {e}")))?;
        if self.state.groups.contains_key(&info.group_id) {
            return Err(CryptoError::GroupAlreadyExists(info.group_id.to_string()));
        }

        let secret = derive_key(&info.external_secret, MLS_ADVANCE_INFO)?;
        let epoch = info.epoch + 1;
        let mut members: BTreeSet<QualifiedClientId> = info.members.into_iter().collect();
        members.insert(self.client.clone());

        let commit = CommitMessage {
            group_id: info.group_id.clone(),
            epoch,
            payload: bincode::serialize(&CommitPayload {
                ops: vec![MembershipOp::ExternalJoin { member: self.client.clone() }],
            })?,
        };
        let group_info = encode_group_info(&info.group_id, epoch, &members, &secret)?;

        self.state.groups.insert(
            info.group_id.clone(),
            GroupState {
                epoch,
                secret: SecretBytes(secret),
                members,
                pending_proposals: Vec::new(),
                pending_commit: None,
            },
        );
        Ok((info.group_id, CommitBundle { commit, welcome: None, group_info }))
    }

    async fn mls_apply_commit(&mut self, commit: &CommitMessage) -> CryptoResult<u64> {
        let payload: CommitPayload = bincode::deserialize(&commit.payload)
            .map_err(|e| CryptoError::MalformedCiphertext(format!("commit payload: {e}")))?;
        let state = self.group_mut(&commit.group_id)?;
        if commit.epoch != state.epoch + 1 {
            return Err(CryptoError::Internal(format!(
                "commit for epoch {} applied at epoch {}",
                commit.epoch, state.epoch
            )));
        }

        let external = payload
            .ops
            .iter()
            .any(|op| matches!(op, MembershipOp::ExternalJoin { .. }));
        for op in payload.ops {
            match op {
                MembershipOp::Add { member, .. } => {
                    state.members.insert(member);
                }
                MembershipOp::Remove { member } => {
                    if !state.members.remove(&member) {
                        return Err(CryptoError::MemberNotFound(member.to_string()));
                    }
                }
                MembershipOp::Update => {}
                MembershipOp::ExternalJoin { member } => {
                    state.members.insert(member);
                }
            }
        }

        state.secret = if external {
            let external_secret = derive_key(&state.secret.0, MLS_EXTERNAL_INFO)?;
            SecretBytes(derive_key(&external_secret, MLS_ADVANCE_INFO)?)
        } else {
            SecretBytes(derive_key(&state.secret.0, MLS_EPOCH_INFO)?)
        };
        state.epoch = commit.epoch;
        // A remote commit supersedes anything we had staged or buffered
        state.pending_commit = None;
        state.pending_proposals.clear();
        Ok(state.epoch)
    }

    async fn mls_encrypt(
        &mut self,
        group: &GroupId,
        plaintext: &[u8],
    ) -> CryptoResult<ApplicationMessage> {
        let state = self.group(group)?;
        let mut aad = group.as_bytes().to_vec();
        aad.extend_from_slice(&state.epoch.to_be_bytes());
        let (nonce, ciphertext) = seal(&state.secret.0, &aad, plaintext)?;
        Ok(ApplicationMessage {
            group_id: group.clone(),
            epoch: state.epoch,
            payload: bincode::serialize(&SealedPayload { nonce, ciphertext })?,
        })
    }

    async fn mls_decrypt(
        &mut self,
        group: &GroupId,
        message: &ApplicationMessage,
    ) -> CryptoResult<Vec<u8>> {
        let state = self.group(group)?;
        let sealed: SealedPayload = bincode::deserialize(&message.payload)
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;
        let mut aad = group.as_bytes().to_vec();
        aad.extend_from_slice(&message.epoch.to_be_bytes());
        open(&state.secret.0, &aad, &sealed.nonce, &sealed.ciphertext)
    }

    async fn mls_wipe_group(&mut self, group: &GroupId) -> CryptoResult<()> {
        self.state.groups.remove(group);
        Ok(())
    }

    async fn mls_clear_all(&mut self) -> CryptoResult<()> {
        self.state.groups.clear();
        self.state.key_packages.clear();
        Ok(())
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot(self.state.clone())
    }

    fn restore(&mut self, snapshot: EngineSnapshot) {
        self.state = snapshot.0;
    }
}
