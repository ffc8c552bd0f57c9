//! # ジョブ実行器
//!
//! job.executeフレームごとにコンテキストを構築し、ハンドラを有界寿命の
//! タスクとして起動する。並列数はセマフォで制限され、デッドライン超過は
//! タスクの中断と `error = "timeout"` の応答になる。
//!
//! ハンドラの失敗（エラー返却・パニック・タイムアウト）がランタイムを
//! 落とすことはない。応答フレームと結果エンドポイント送信は独立した
//! 通知経路であり、並行して行われる。

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use challenge_crypto::Ed25519SigningKey;
use challenge_types::{JobReport, JobRequest, PeerMessage, PeerRole};

use crate::config::Settings;
use crate::context::Context;
use crate::error::JobError;
use crate::lifecycle::Orchestrator;
use crate::registry::{FrozenRegistry, JobHandler, JobOutcome};
use crate::transport::manager::PeerSessionManager;

/// ジョブ実行器。
pub struct JobExecutor {
    registry: Arc<FrozenRegistry>,
    settings: Arc<Settings>,
    orchestrator: Arc<Orchestrator>,
    manager: Arc<PeerSessionManager>,
    base_context: Context,
    signing: Arc<Ed25519SigningKey>,
    semaphore: Arc<Semaphore>,
}

impl JobExecutor {
    /// 実行器を構築する。
    pub fn new(
        registry: Arc<FrozenRegistry>,
        settings: Arc<Settings>,
        orchestrator: Arc<Orchestrator>,
        manager: Arc<PeerSessionManager>,
        base_context: Context,
        signing: Arc<Ed25519SigningKey>,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(settings.max_parallel_jobs));
        Arc::new(Self {
            registry,
            settings,
            orchestrator,
            manager,
            base_context,
            signing,
            semaphore,
        })
    }

    /// ジョブキューを処理するループ。
    /// 並列枠が空くまで次のジョブを取り出さないため、キュー容量が
    /// そのままバックプレッシャー境界になる。
    pub async fn run(self: Arc<Self>, mut jobs_rx: mpsc::Receiver<JobRequest>) {
        while let Some(request) = jobs_rx.recv().await {
            // Serving以外では即時拒否（並列枠を消費しない）
            if !self.orchestrator.is_serving() {
                let report = JobReport::failed(&request.job_id, JobError::NotReady.wire_tag());
                self.deliver(report).await;
                continue;
            }

            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = Arc::clone(&self);
            tokio::spawn(async move {
                let report = executor.execute_request(request).await;
                executor.deliver(report).await;
                drop(permit);
            });
        }
    }

    /// 1件のジョブを実行し、検証済みの結果を返す。
    pub async fn execute_request(&self, request: JobRequest) -> JobReport {
        if !self.orchestrator.is_serving() {
            return JobReport::failed(&request.job_id, JobError::NotReady.wire_tag());
        }

        let handler = match self.registry.resolve_job(request.job_name.as_deref()) {
            Some(handler) => handler.clone(),
            None => {
                tracing::warn!(job_id = %request.job_id, "ジョブハンドラが見つかりません");
                return JobReport::failed(&request.job_id, JobError::NoHandler.wire_tag());
            }
        };

        let ctx = self
            .base_context
            .for_job(&request, Arc::clone(&self.signing));
        let job_id = request.job_id.clone();
        let payload = request.payload;

        // ハンドラは専用タスクで実行し、デッドラインで中断する
        let mut task = match handler {
            JobHandler::Async(f) => tokio::spawn(f(ctx, payload)),
            JobHandler::Blocking(f) => tokio::task::spawn_blocking(move || f(ctx, payload)),
        };

        let outcome = match tokio::time::timeout(self.settings.job_deadline, &mut task).await {
            Err(_) => {
                task.abort();
                tracing::warn!(%job_id, "ジョブがデッドラインを超過しました");
                return JobReport::failed(&job_id, JobError::Timeout.wire_tag());
            }
            Ok(Err(join_error)) => {
                // ハンドラのパニックはランタイムに伝播させない
                tracing::error!(%job_id, "ジョブハンドラが異常終了しました: {join_error}");
                return JobReport::failed(&job_id, format!("panic: {join_error}"));
            }
            Ok(Ok(Err(handler_error))) => {
                tracing::warn!(%job_id, "ジョブハンドラがエラーを返しました: {handler_error}");
                return JobReport::failed(&job_id, handler_error.to_string());
            }
            Ok(Ok(Ok(outcome))) => outcome,
        };

        validate_outcome(&job_id, outcome, self.settings.max_log_bytes)
    }

    /// 実行中ジョブの完了を待つ。期限内に全並列枠が空けばtrue。
    pub async fn drain(&self, deadline: std::time::Duration) -> bool {
        matches!(
            tokio::time::timeout(
                deadline,
                self.semaphore
                    .acquire_many(self.settings.max_parallel_jobs as u32),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// 応答フレームの送信と結果エンドポイントへの送信を並行して行う。
    /// 結果送信の失敗は応答フレームに影響しない（ログのみ）。
    async fn deliver(&self, report: JobReport) {
        let reply = async {
            if let Err(e) = self
                .manager
                .send_to(PeerRole::Consumer, PeerMessage::JobResult(report.clone()))
                .await
            {
                // 破棄済みセッション宛の応答はドロップする（再送しない）
                tracing::warn!(job_id = %report.job_id, "応答フレームを送信できません: {e}");
            }
        };
        let submit = async {
            if let Err(e) = self.base_context.results.submit(&report).await {
                tracing::warn!(job_id = %report.job_id, "結果送信に失敗しました: {e}");
            }
        };
        tokio::join!(reply, submit);
    }
}

/// ハンドラの返却値を検証して応答レポートに変換する。
///
/// - スコアは[0, 1]にクランプし、範囲外なら `error = "invalid_score"`
/// - 非有限のメトリクス値は落とす
/// - ログは合計バイト数で切り詰める
pub fn validate_outcome(job_id: &str, outcome: JobOutcome, max_log_bytes: usize) -> JobReport {
    let mut error = None;

    let score = if !outcome.score.is_finite() {
        error = Some("invalid_score".to_string());
        0.0
    } else if !(0.0..=1.0).contains(&outcome.score) {
        error = Some("invalid_score".to_string());
        outcome.score.clamp(0.0, 1.0)
    } else {
        outcome.score
    };

    let metrics: BTreeMap<String, f64> = outcome
        .metrics
        .into_iter()
        .filter(|(_, value)| value.is_finite())
        .collect();

    let mut logs = Vec::new();
    let mut total = 0usize;
    for line in outcome.logs {
        if total + line.len() > max_log_bytes {
            tracing::debug!(%job_id, "ログをバイト上限で切り詰めました");
            break;
        }
        total += line.len();
        logs.push(line);
    }

    JobReport {
        job_id: job_id.to_string(),
        score,
        metrics,
        job_type: outcome.job_type,
        logs,
        allowed_log_containers: outcome.allowed_log_containers,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::identity::Identity;
    use crate::lifecycle::LifecycleState;
    use crate::orm::{OrmBridge, OrmClient, PolicyCell};
    use crate::registry::ChallengeRegistry;
    use crate::runtime::dev::DevQuoteProvider;
    use crate::runtime::QuoteProvider;

    fn request(job_id: &str, job_name: Option<&str>) -> JobRequest {
        JobRequest {
            job_id: job_id.to_string(),
            challenge_id: "c1".to_string(),
            validator_hotkey: "hk".to_string(),
            session_token: "token".to_string(),
            job_name: job_name.map(str::to_string),
            payload: serde_json::json!({}),
        }
    }

    fn executor_with(registry: ChallengeRegistry, settings: Settings) -> Arc<JobExecutor> {
        let settings = Arc::new(settings);
        let identity = Arc::new(Identity::generate());
        let provider: Arc<dyn QuoteProvider> = Arc::new(DevQuoteProvider::new());
        let (manager, _channels) =
            PeerSessionManager::new(Arc::clone(&identity), provider, Arc::clone(&settings));
        let orchestrator = Orchestrator::new(Arc::clone(&settings));
        orchestrator.force_state(LifecycleState::Serving);

        let bridge = OrmBridge::new(
            Arc::new(PolicyCell::new()),
            Arc::clone(&manager),
            Duration::from_secs(1),
            Arc::new(|| {}),
        );
        let signing = Arc::new(identity.signing_key());
        let base_context = Context::from_settings(
            &settings,
            Arc::clone(&signing),
            OrmClient::new(bridge),
        );
        JobExecutor::new(
            registry.freeze(),
            settings,
            orchestrator,
            manager,
            base_context,
            signing,
        )
    }

    /// 正常系: 登録済みデフォルトハンドラの結果がそのまま返る（S2）
    #[tokio::test]
    async fn test_happy_path_job() {
        let mut registry = ChallengeRegistry::new();
        registry.register_default_job(JobHandler::Blocking(Arc::new(|_ctx, _payload| {
            Ok(JobOutcome {
                score: 0.95,
                metrics: BTreeMap::from([("acc".to_string(), 0.95)]),
                job_type: "eval".to_string(),
                ..Default::default()
            })
        })));
        let executor = executor_with(registry, Settings::for_tests());

        let report = executor.execute_request(request("j1", None)).await;
        assert_eq!(report.job_id, "j1");
        assert_eq!(report.score, 0.95);
        assert_eq!(report.metrics.get("acc"), Some(&0.95));
        assert_eq!(report.job_type, "eval");
        assert!(report.error.is_none());
    }

    /// デッドライン超過でtimeoutが返り、その後も実行器が機能することを確認（S3）
    #[tokio::test]
    async fn test_timeout_then_recovery() {
        let mut settings = Settings::for_tests();
        settings.job_deadline = Duration::from_millis(100);

        let mut registry = ChallengeRegistry::new();
        registry.register_default_job(JobHandler::Async(Arc::new(|_ctx, payload| {
            Box::pin(async move {
                if payload.get("sleep").is_some() {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(JobOutcome {
                    score: 0.95,
                    metrics: BTreeMap::from([("acc".to_string(), 0.95)]),
                    job_type: "eval".to_string(),
                    ..Default::default()
                })
            })
        })));
        let executor = executor_with(registry, settings);

        let mut sleeping = request("j2", None);
        sleeping.payload = serde_json::json!({"sleep": true});
        let report = executor.execute_request(sleeping).await;
        assert_eq!(report.job_id, "j2");
        assert_eq!(report.score, 0.0);
        assert_eq!(report.error.as_deref(), Some("timeout"));

        // S3の後続: 通常ジョブは引き続き成功する
        let report = executor.execute_request(request("j3", None)).await;
        assert_eq!(report.score, 0.95);
        assert!(report.error.is_none());
    }

    /// 範囲外スコアがクランプされ、invalid_scoreが付くことを確認（S4）
    #[tokio::test]
    async fn test_out_of_range_score() {
        let mut registry = ChallengeRegistry::new();
        registry.register_default_job(JobHandler::Blocking(Arc::new(|_ctx, _payload| {
            Ok(JobOutcome {
                score: 1.7,
                job_type: "x".to_string(),
                ..Default::default()
            })
        })));
        let executor = executor_with(registry, Settings::for_tests());

        let report = executor.execute_request(request("j4", None)).await;
        assert_eq!(report.score, 1.0);
        assert_eq!(report.job_type, "x");
        assert_eq!(report.error.as_deref(), Some("invalid_score"));
    }

    /// Serving以外の状態でnot_readyが返ることを確認
    #[tokio::test]
    async fn test_not_ready_gating() {
        let mut registry = ChallengeRegistry::new();
        registry.register_default_job(JobHandler::Blocking(Arc::new(|_ctx, _payload| {
            Ok(JobOutcome::default())
        })));
        let executor = executor_with(registry, Settings::for_tests());
        executor.orchestrator.force_state(LifecycleState::Migrating);

        let report = executor.execute_request(request("j5", None)).await;
        assert_eq!(report.score, 0.0);
        assert_eq!(report.error.as_deref(), Some("not_ready"));
    }

    /// ハンドラ未登録でno_handlerが返ることを確認
    #[tokio::test]
    async fn test_no_handler() {
        let executor = executor_with(ChallengeRegistry::new(), Settings::for_tests());
        let report = executor.execute_request(request("j6", Some("missing"))).await;
        assert_eq!(report.error.as_deref(), Some("no_handler"));
        assert_eq!(report.score, 0.0);
    }

    /// ハンドラのパニックが封じ込められることを確認
    #[tokio::test]
    async fn test_panic_contained() {
        let mut registry = ChallengeRegistry::new();
        registry.register_default_job(JobHandler::Blocking(Arc::new(|_ctx, _payload| {
            panic!("handler exploded");
        })));
        let executor = executor_with(registry, Settings::for_tests());

        let report = executor.execute_request(request("j7", None)).await;
        assert_eq!(report.score, 0.0);
        assert!(report.error.as_deref().unwrap_or_default().starts_with("panic:"));
    }

    /// 名前付きハンドラが優先されることを確認
    #[tokio::test]
    async fn test_named_handler_resolution() {
        let mut registry = ChallengeRegistry::new();
        registry.register_job(
            "evaluate_agent",
            JobHandler::Blocking(Arc::new(|_ctx, _payload| {
                Ok(JobOutcome {
                    job_type: "named".to_string(),
                    score: 0.5,
                    ..Default::default()
                })
            })),
        );
        registry.register_default_job(JobHandler::Blocking(Arc::new(|_ctx, _payload| {
            Ok(JobOutcome {
                job_type: "default".to_string(),
                score: 0.5,
                ..Default::default()
            })
        })));
        let executor = executor_with(registry, Settings::for_tests());

        let report = executor
            .execute_request(request("j8", Some("evaluate_agent")))
            .await;
        assert_eq!(report.job_type, "named");

        let report = executor.execute_request(request("j9", None)).await;
        assert_eq!(report.job_type, "default");
    }

    /// 検証規則（非有限メトリクス・ログ切り詰め）を確認
    #[test]
    fn test_validate_outcome_rules() {
        let outcome = JobOutcome {
            score: 0.5,
            metrics: BTreeMap::from([
                ("ok".to_string(), 1.0),
                ("nan".to_string(), f64::NAN),
                ("inf".to_string(), f64::INFINITY),
            ]),
            job_type: "eval".to_string(),
            logs: vec!["a".repeat(600), "b".repeat(600)],
            allowed_log_containers: vec!["runner".to_string()],
        };
        let report = validate_outcome("j", outcome, 1000);
        assert_eq!(report.metrics.len(), 1);
        assert_eq!(report.metrics.get("ok"), Some(&1.0));
        // 2本目のログで上限を超えるため1本だけ残る
        assert_eq!(report.logs.len(), 1);
        assert!(report.error.is_none());
        assert_eq!(report.allowed_log_containers, vec!["runner".to_string()]);

        // NaNスコアもinvalid_score扱い
        let report = validate_outcome(
            "j",
            JobOutcome {
                score: f64::NAN,
                ..Default::default()
            },
            1000,
        );
        assert_eq!(report.score, 0.0);
        assert_eq!(report.error.as_deref(), Some("invalid_score"));
    }
}
