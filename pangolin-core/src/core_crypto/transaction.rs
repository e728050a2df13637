//! Transaction layer
//!
//! All cryptographic mutations flow through a transaction opened here. A
//! transaction is all-or-nothing: if the unit of work fails, the engine is
//! restored to its pre-transaction snapshot; if it succeeds, every mutation
//! is visible before the call returns.
//!
//! At most one transaction is open against a store connection at a time.
//! Concurrent callers queue in FIFO order on a fair mutex; opening a
//! transaction from inside a unit of work is a programming error and fails
//! fast with `TransactionAlreadyOpen`. An in-flight transaction cannot be
//! cancelled; callers must let it run to completion.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core_mls::MlsGroupManager;
use crate::core_proteus::ProteusSessionManager;
use crate::metrics::{record_counter, Timer};

use super::engine::CryptoEngine;
use super::errors::{CryptoError, CryptoResult};

tokio::task_local! {
    static TRANSACTION_OPEN: ();
}

/// Which sub-contexts a transaction exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionScope {
    /// Pairwise sessions only
    Proteus,
    /// Group state only
    Mls,
    /// Both protocols in one atomic unit
    Mixed,
}

impl TransactionScope {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionScope::Proteus => "proteus",
            TransactionScope::Mls => "mls",
            TransactionScope::Mixed => "mixed",
        }
    }
}

/// Scoped handle over one open transaction, exposing both protocol
/// sub-contexts
pub struct TransactionContext<E: CryptoEngine> {
    engine: Arc<Mutex<E>>,
}

impl<E: CryptoEngine> TransactionContext<E> {
    pub(crate) fn new(engine: Arc<Mutex<E>>) -> Self {
        Self { engine }
    }

    /// Pairwise-session sub-context
    pub fn proteus(&self) -> ProteusSessionManager<E> {
        ProteusSessionManager::new(self.engine.clone())
    }

    /// Group sub-context
    pub fn mls(&self) -> MlsGroupManager<E> {
        MlsGroupManager::new(self.engine.clone())
    }

    /// Create the local identity if it does not exist yet
    pub async fn init_identity(&self) -> CryptoResult<()> {
        self.engine.lock().await.init_identity().await
    }

    /// Whether a local identity exists
    pub async fn has_identity(&self) -> bool {
        self.engine.lock().await.has_identity().await
    }
}

/// Opens transactions against one underlying store connection
pub struct TransactionProvider<E: CryptoEngine> {
    engine: Arc<Mutex<E>>,
    serializer: Arc<Mutex<()>>,
}

impl<E: CryptoEngine> TransactionProvider<E> {
    /// Wrap an engine in a provider owning its only connection
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            serializer: Arc::new(Mutex::new(())),
        }
    }

    /// Run a unit of work with access to both sub-contexts
    pub async fn transaction<T, F, Fut>(&self, name: &str, work: F) -> CryptoResult<T>
    where
        F: FnOnce(TransactionContext<E>) -> Fut,
        Fut: std::future::Future<Output = CryptoResult<T>>,
    {
        let engine = self.engine.clone();
        self.execute(name, TransactionScope::Mixed, work(TransactionContext::new(engine)))
            .await
    }

    /// Run a unit of work against the Proteus sub-context only
    pub async fn proteus_transaction<T, F, Fut>(&self, name: &str, work: F) -> CryptoResult<T>
    where
        F: FnOnce(ProteusSessionManager<E>) -> Fut,
        Fut: std::future::Future<Output = CryptoResult<T>>,
    {
        let engine = self.engine.clone();
        self.execute(name, TransactionScope::Proteus, work(ProteusSessionManager::new(engine)))
            .await
    }

    /// Run a unit of work against the MLS sub-context only
    pub async fn mls_transaction<T, F, Fut>(&self, name: &str, work: F) -> CryptoResult<T>
    where
        F: FnOnce(MlsGroupManager<E>) -> Fut,
        Fut: std::future::Future<Output = CryptoResult<T>>,
    {
        let engine = self.engine.clone();
        self.execute(name, TransactionScope::Mls, work(MlsGroupManager::new(engine)))
            .await
    }

    async fn execute<T, Fut>(
        &self,
        name: &str,
        scope: TransactionScope,
        work: Fut,
    ) -> CryptoResult<T>
    where
        Fut: std::future::Future<Output = CryptoResult<T>>,
    {
        if TRANSACTION_OPEN.try_with(|_| ()).is_ok() {
            return Err(CryptoError::TransactionAlreadyOpen);
        }

        // Fair mutex: waiting transactions are served in FIFO order
        let _serial = self.serializer.lock().await;
        let snapshot = self.engine.lock().await.snapshot();

        debug!(transaction = name, scope = scope.as_str(), "transaction started");
        let timer = Timer::new("crypto.transaction.duration_ms");
        let result = TRANSACTION_OPEN.scope((), work).await;
        timer.stop();

        match result {
            Ok(value) => {
                record_counter("crypto.transactions.committed", 1);
                debug!(transaction = name, "transaction committed");
                Ok(value)
            }
            Err(error) => {
                self.engine.lock().await.restore(snapshot);
                record_counter("crypto.transactions.rolled_back", 1);
                warn!(transaction = name, %error, "transaction rolled back");
                Err(error)
            }
        }
    }
}

impl<E: CryptoEngine> Clone for TransactionProvider<E> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), serializer: self.serializer.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::engine::MemoryCryptoEngine;
    use crate::core_crypto::types::{ClientId, GroupId, QualifiedClientId, QualifiedId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provider() -> TransactionProvider<MemoryCryptoEngine> {
        let client = QualifiedClientId::new(QualifiedId::random("example.com"), ClientId::new("c1"));
        TransactionProvider::new(MemoryCryptoEngine::with_identity(client))
    }

    #[tokio::test]
    async fn test_successful_transaction_commits() {
        let provider = provider();
        let group = GroupId::random();

        let group_clone = group.clone();
        provider
            .mls_transaction("create", |mls| async move {
                mls.create_conversation(&group_clone).await
            })
            .await
            .unwrap();

        let group_clone = group.clone();
        let exists = provider
            .mls_transaction("check", |mls| async move {
                mls.conversation_exists(&group_clone).await
            })
            .await
            .unwrap();
        assert!(exists);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let provider = provider();
        let group = GroupId::random();

        let group_clone = group.clone();
        let result: CryptoResult<()> = provider
            .mls_transaction("create-then-fail", |mls| async move {
                mls.create_conversation(&group_clone).await?;
                Err(CryptoError::Internal("caller bailed".to_string()))
            })
            .await;
        assert!(result.is_err());

        let group_clone = group.clone();
        let exists = provider
            .mls_transaction("check", |mls| async move {
                mls.conversation_exists(&group_clone).await
            })
            .await
            .unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    async fn test_handled_protocol_error_still_commits() {
        let provider = provider();
        let group = GroupId::random();

        let group_clone = group.clone();
        provider
            .transaction("mixed", |ctx| async move {
                // A protocol-level failure the work recovers from must not
                // poison the rest of the unit of work
                let decrypt_result = ctx
                    .proteus()
                    .decrypt(
                        &QualifiedClientId::new(
                            QualifiedId::random("example.com"),
                            ClientId::new("ghost"),
                        ),
                        &[0xde, 0xad],
                    )
                    .await;
                assert!(decrypt_result.is_err());

                ctx.mls().create_conversation(&group_clone).await
            })
            .await
            .unwrap();

        let group_clone = group.clone();
        let exists = provider
            .mls_transaction("check", |mls| async move {
                mls.conversation_exists(&group_clone).await
            })
            .await
            .unwrap();
        assert!(exists);
    }

    #[tokio::test]
    async fn test_nested_transaction_fails_fast() {
        let provider = provider();

        let inner = provider.clone();
        let result: CryptoResult<()> = provider
            .transaction("outer", |_ctx| async move {
                inner.transaction("inner", |_ctx| async move { Ok(()) }).await
            })
            .await;
        assert!(matches!(result, Err(CryptoError::TransactionAlreadyOpen)));
    }

    #[tokio::test]
    async fn test_transactions_do_not_interleave() {
        let provider = Arc::new(provider());
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let provider = provider.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                provider
                    .mls_transaction("concurrent", |mls| async move {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        let group = GroupId::new(vec![i]);
                        mls.create_conversation(&group).await?;
                        tokio::task::yield_now().await;
                        assert_eq!(active.fetch_sub(1, Ordering::SeqCst), 1);
                        Ok(())
                    })
                    .await
            }));
        }
        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        let count = provider
            .mls_transaction("count", |mls| async move {
                let mut count = 0;
                for i in 0..8u8 {
                    if mls.conversation_exists(&GroupId::new(vec![i])).await? {
                        count += 1;
                    }
                }
                Ok(count)
            })
            .await
            .unwrap();
        assert_eq!(count, 8);
    }
}
