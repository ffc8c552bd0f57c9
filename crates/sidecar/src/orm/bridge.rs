//! # ORMブリッジ
//!
//! ハンドラに提供されるクライアントAPI。クエリを構造化フレームに変換し、
//! 適切なピアへ送って相関IDで応答を突き合わせる。
//!
//! ## ルーティング
//! - 読み取り: Consumer優先（負荷分離）、不在時はAdmin
//! - 書き込み・DDL: Adminのみ。Admin不在時は即時 `OrmError::NoAdmin`
//!
//! ## キャンセル
//! 要求元タスクのデッドライン超過などでFutureがドロップされた場合、
//! 相関IDはガードにより退役し、遅延して届いた応答は破棄される。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use challenge_types::{
    ColumnValue, OrderBy, OrmFailureKind, OrmOperation, OrmQuery, PeerMessage, PeerRole,
    QueryFilter, QueryRows,
};

use crate::error::{OrmError, TransportError};
use crate::orm::policy::PolicyCell;
use crate::transport::manager::PeerSessionManager;

/// 応答待ちテーブルのエントリ。
struct PendingEntry {
    role: PeerRole,
    tx: oneshot::Sender<Result<QueryRows, OrmError>>,
}

/// ORMブリッジ本体。
pub struct OrmBridge {
    policy: Arc<PolicyCell>,
    manager: Arc<PeerSessionManager>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    timeout: Duration,
    /// Admin不在時の書き込み試行の通知先（ライフサイクル遷移に使用）
    no_admin_notify: Arc<dyn Fn() + Send + Sync>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl OrmBridge {
    /// ブリッジを構築する。
    pub fn new(
        policy: Arc<PolicyCell>,
        manager: Arc<PeerSessionManager>,
        timeout: Duration,
        no_admin_notify: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy,
            manager,
            pending: Mutex::new(HashMap::new()),
            timeout,
            no_admin_notify,
        })
    }

    /// 成功応答を対応する待機者へ届ける。対応がなければ警告して破棄する。
    pub fn resolve_success(&self, query_id: &str, result: QueryRows) {
        match lock(&self.pending).remove(query_id) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(result));
            }
            None => tracing::warn!(query_id, "対応しないORM応答を破棄しました"),
        }
    }

    /// 失敗応答を対応する待機者へ届ける。
    pub fn resolve_failure(&self, query_id: &str, kind: OrmFailureKind, message: String) {
        match lock(&self.pending).remove(query_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(OrmError::from_failure(kind, message)));
            }
            None => tracing::warn!(query_id, "対応しないORMエラー応答を破棄しました"),
        }
    }

    /// 指定ロールのセッション破棄に伴い、そのロール宛の待機を全て退役させる。
    /// 破棄されたセッションの要求は再送しない。
    pub fn retire_role(&self, role: PeerRole) {
        let mut pending = lock(&self.pending);
        pending.retain(|_, entry| entry.role != role);
    }

    fn register(
        self: &Arc<Self>,
        query_id: String,
        role: PeerRole,
    ) -> (oneshot::Receiver<Result<QueryRows, OrmError>>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(query_id.clone(), PendingEntry { role, tx });
        (
            rx,
            PendingGuard {
                bridge: Arc::clone(self),
                query_id,
            },
        )
    }

    /// クエリを実行する。ポリシー検査はマーシャリング前に行う。
    pub async fn execute(self: &Arc<Self>, query: OrmQuery) -> Result<QueryRows, OrmError> {
        match self.policy.get() {
            Some(policy) => policy.check_query(&query)?,
            // ポリシー未適用は全拒否
            None => return Err(OrmError::Forbidden(query.table.clone())),
        }

        let role = if query.operation.is_write() {
            if !self.manager.is_connected(PeerRole::Admin) {
                (self.no_admin_notify)();
                return Err(OrmError::NoAdmin);
            }
            PeerRole::Admin
        } else if self.manager.is_connected(PeerRole::Consumer) {
            PeerRole::Consumer
        } else if self.manager.is_connected(PeerRole::Admin) {
            PeerRole::Admin
        } else {
            return Err(OrmError::SessionClosed);
        };

        let query_id = hex::encode(
            challenge_crypto::random_bytes(16).map_err(|_| OrmError::SessionClosed)?,
        );
        let (rx, _guard) = self.register(query_id.clone(), role);

        let send_result = self
            .manager
            .send_to(role, PeerMessage::OrmRequest { query_id, query })
            .await;
        if let Err(TransportError::Closed(_)) = send_result {
            return if role == PeerRole::Admin {
                Err(OrmError::NoAdmin)
            } else {
                Err(OrmError::SessionClosed)
            };
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => Err(OrmError::Timeout),
            // 送信側ドロップ = セッション破棄で退役済み
            Ok(Err(_)) => Err(OrmError::SessionClosed),
            Ok(Ok(result)) => result,
        }
    }
}

/// 相関IDの退役ガード。正常応答後は対応エントリが既に消えているため無害。
struct PendingGuard {
    bridge: Arc<OrmBridge>,
    query_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.bridge.pending).remove(&self.query_id);
    }
}

/// ハンドラ向けのORMクライアント。
#[derive(Clone)]
pub struct OrmClient {
    bridge: Arc<OrmBridge>,
}

impl OrmClient {
    /// ブリッジからクライアントを作る。
    pub fn new(bridge: Arc<OrmBridge>) -> Self {
        Self { bridge }
    }

    /// SELECTを実行する。
    pub async fn select(
        &self,
        table: &str,
        columns: Option<Vec<String>>,
        filters: Vec<QueryFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<QueryRows, OrmError> {
        self.bridge
            .execute(OrmQuery {
                operation: OrmOperation::Select,
                table: table.to_string(),
                schema: None,
                columns,
                filters,
                order_by,
                limit,
                offset,
                values: None,
                set_values: None,
            })
            .await
    }

    /// COUNTを実行する。
    pub async fn count(&self, table: &str, filters: Vec<QueryFilter>) -> Result<u64, OrmError> {
        let result = self
            .bridge
            .execute(OrmQuery {
                operation: OrmOperation::Count,
                table: table.to_string(),
                schema: None,
                columns: None,
                filters,
                order_by: Vec::new(),
                limit: None,
                offset: None,
                values: None,
                set_values: None,
            })
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|count| count.as_u64())
            .unwrap_or(0))
    }

    /// INSERTを実行する。
    pub async fn insert(
        &self,
        table: &str,
        values: BTreeMap<String, serde_json::Value>,
    ) -> Result<QueryRows, OrmError> {
        self.bridge
            .execute(OrmQuery {
                operation: OrmOperation::Insert,
                table: table.to_string(),
                schema: None,
                columns: None,
                filters: Vec::new(),
                order_by: Vec::new(),
                limit: None,
                offset: None,
                values: Some(column_values(values)),
                set_values: None,
            })
            .await
    }

    /// UPDATEを実行する。
    pub async fn update(
        &self,
        table: &str,
        set_values: BTreeMap<String, serde_json::Value>,
        filters: Vec<QueryFilter>,
    ) -> Result<QueryRows, OrmError> {
        self.bridge
            .execute(OrmQuery {
                operation: OrmOperation::Update,
                table: table.to_string(),
                schema: None,
                columns: None,
                filters,
                order_by: Vec::new(),
                limit: None,
                offset: None,
                values: None,
                set_values: Some(column_values(set_values)),
            })
            .await
    }

    /// DELETEを実行する。WHERE句は必須。
    pub async fn delete(
        &self,
        table: &str,
        filters: Vec<QueryFilter>,
    ) -> Result<QueryRows, OrmError> {
        self.bridge
            .execute(OrmQuery {
                operation: OrmOperation::Delete,
                table: table.to_string(),
                schema: None,
                columns: None,
                filters,
                order_by: Vec::new(),
                limit: None,
                offset: None,
                values: None,
                set_values: None,
            })
            .await
    }
}

fn column_values(values: BTreeMap<String, serde_json::Value>) -> Vec<ColumnValue> {
    values
        .into_iter()
        .map(|(column, value)| ColumnValue { column, value })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::config::Settings;
    use crate::identity::Identity;
    use crate::orm::policy::{OrmPolicy, TableRule};
    use crate::runtime::dev::DevQuoteProvider;
    use crate::runtime::QuoteProvider;
    use crate::transport::manager::{ManagerChannels, PeerSessionManager};

    fn jobs_policy_cell() -> Arc<PolicyCell> {
        let cell = Arc::new(PolicyCell::new());
        cell.apply(OrmPolicy::new().with_table(
            "jobs",
            TableRule::new()
                .allow_read(["id", "score"])
                .allow_insert(["id", "score"])
                .allow_update(["score"])
                .allow_delete(),
        ))
        .unwrap();
        cell
    }

    async fn manager_without_peers() -> (Arc<PeerSessionManager>, ManagerChannels) {
        let identity = Arc::new(Identity::generate());
        let provider: Arc<dyn QuoteProvider> = Arc::new(DevQuoteProvider::new());
        PeerSessionManager::new(identity, provider, Arc::new(Settings::for_tests()))
    }

    fn bridge_with(
        manager: Arc<PeerSessionManager>,
        notify_count: Arc<AtomicU32>,
    ) -> Arc<OrmBridge> {
        OrmBridge::new(
            jobs_policy_cell(),
            manager,
            Duration::from_millis(500),
            Arc::new(move || {
                notify_count.fetch_add(1, Ordering::Relaxed);
            }),
        )
    }

    /// Admin不在時の書き込みがNoAdminで即時失敗し、通知が飛ぶことを確認
    #[tokio::test]
    async fn test_write_without_admin_fails_fast() {
        let (manager, _channels) = manager_without_peers().await;
        let notify = Arc::new(AtomicU32::new(0));
        let bridge = bridge_with(manager, Arc::clone(&notify));
        let client = OrmClient::new(bridge);

        let err = client
            .insert(
                "jobs",
                BTreeMap::from([("id".to_string(), serde_json::json!("j1"))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::NoAdmin));
        assert_eq!(notify.load(Ordering::Relaxed), 1);
    }

    /// ポリシー未許可カラムがマーシャリング前にForbiddenになることを確認
    #[tokio::test]
    async fn test_policy_enforced_before_marshalling() {
        let (manager, _channels) = manager_without_peers().await;
        let bridge = bridge_with(manager, Arc::new(AtomicU32::new(0)));
        let client = OrmClient::new(bridge);

        let err = client
            .select("jobs", Some(vec!["created_at".to_string()]), vec![], vec![], None, None)
            .await
            .unwrap_err();
        match err {
            OrmError::Forbidden(column) => assert_eq!(column, "created_at"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// WHERE句のないDELETEが常にUnsafeDeleteになることを確認
    #[tokio::test]
    async fn test_delete_requires_filters() {
        let (manager, _channels) = manager_without_peers().await;
        let bridge = bridge_with(manager, Arc::new(AtomicU32::new(0)));
        let client = OrmClient::new(bridge);

        let err = client.delete("jobs", vec![]).await.unwrap_err();
        assert!(matches!(err, OrmError::UnsafeDelete));
    }

    /// 対応しない応答が安全に破棄されることを確認
    #[tokio::test]
    async fn test_unmatched_response_discarded() {
        let (manager, _channels) = manager_without_peers().await;
        let bridge = bridge_with(manager, Arc::new(AtomicU32::new(0)));
        bridge.resolve_success("unknown-query", QueryRows::default());
        bridge.resolve_failure("unknown-query", OrmFailureKind::NotFound, String::new());
    }

    /// ロール退役で待機中の要求がSessionClosedになることを確認
    #[tokio::test]
    async fn test_retire_role_drops_pending() {
        let (manager, _channels) = manager_without_peers().await;
        let bridge = bridge_with(manager, Arc::new(AtomicU32::new(0)));

        let (rx, guard) = bridge.register("q1".to_string(), PeerRole::Consumer);
        bridge.retire_role(PeerRole::Consumer);
        assert!(rx.await.is_err());
        drop(guard);
    }

    use crate::transport::frame::{open_frame, read_prefixed, seal_frame, write_prefixed};
    use crate::transport::session::tests::client_handshake;
    use crate::transport::RuntimeEvent;

    /// Consumerセッション経由の読み取りが往復することを確認（S5の読み取り側）
    #[tokio::test]
    async fn test_read_roundtrip_via_consumer() {
        let identity = Arc::new(Identity::generate());
        let provider: Arc<dyn QuoteProvider> = Arc::new(DevQuoteProvider::new());
        let (manager, mut channels) =
            PeerSessionManager::new(identity, provider, Arc::new(Settings::for_tests()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&manager).serve(listener));

        let bridge = OrmBridge::new(
            jobs_policy_cell(),
            Arc::clone(&manager),
            Duration::from_secs(5),
            Arc::new(|| {}),
        );

        // ミニディスパッチャ: ORM応答をブリッジへ回送する
        let dispatcher_bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            while let Some(event) = channels.events_rx.recv().await {
                if let RuntimeEvent::Frame { message, .. } = event {
                    match message {
                        PeerMessage::OrmResult { query_id, result } => {
                            dispatcher_bridge.resolve_success(&query_id, result);
                        }
                        PeerMessage::OrmFailure {
                            query_id,
                            kind,
                            message,
                        } => {
                            dispatcher_bridge.resolve_failure(&query_id, kind, message);
                        }
                        _ => {}
                    }
                }
            }
        });

        // Consumerとして接続し、サイドカーからのOrmRequestに応答するピアを立てる
        let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
        let nonce = challenge_crypto::random_array::<32>().unwrap();
        let (crypto, _) = client_handshake(&mut peer, PeerRole::Consumer, nonce, false)
            .await
            .unwrap();

        let peer_task = tokio::spawn(async move {
            // seq=0: サイドカーからのOrmRequest
            let frame = read_prefixed(&mut peer, 16 * 1024 * 1024).await.unwrap();
            let message = open_frame(&crypto, PeerRole::Consumer, 0, &frame).unwrap();
            let query_id = match message {
                PeerMessage::OrmRequest { query_id, query } => {
                    assert_eq!(query.table, "jobs");
                    assert!(matches!(query.operation, OrmOperation::Select));
                    query_id
                }
                other => panic!("unexpected message: {other:?}"),
            };

            let mut row = serde_json::Map::new();
            row.insert("id".to_string(), serde_json::json!("j1"));
            row.insert("score".to_string(), serde_json::json!(0.5));
            let reply = PeerMessage::OrmResult {
                query_id,
                result: QueryRows {
                    rows: vec![row],
                    row_count: 1,
                    execution_time_ms: 2,
                },
            };
            let frame = seal_frame(&crypto, PeerRole::Consumer, 0, &reply).unwrap();
            write_prefixed(&mut peer, &frame).await.unwrap();
            peer
        });

        // セッション確立を待つ
        while !manager.is_connected(PeerRole::Consumer) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let client = OrmClient::new(bridge);
        let result = client
            .select(
                "jobs",
                Some(vec!["id".to_string(), "score".to_string()]),
                vec![],
                vec![],
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0]["id"], serde_json::json!("j1"));

        let _ = peer_task.await.unwrap();
    }
}
