//! # ハンドラレジストリ
//!
//! ライフサイクルフック（startup / ready / cleanup / weights）、名前付き
//! ジョブハンドラとデフォルトジョブハンドラ、公開エンドポイントハンドラを
//! 保持する。
//!
//! ## 登録と凍結
//! 登録は `run()` 前に行い、[`ChallengeRegistry::freeze`] で不変化する。
//! 凍結後の変更は所有権の移動により型レベルで不可能。
//!
//! ## 実行形状
//! 各ハンドラは登録時にasync（タスク実行）かblocking（ワーカープール実行）
//! かを選択する。同期ハンドラはランタイムをブロックしない。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::{Context, PublicContext};

/// ジョブハンドラの返却値。検証前の生の結果。
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    /// スコア（検証時に[0, 1]へクランプされる）
    pub score: f64,
    /// メトリクスマップ（非有限値は検証時に落とされる）
    pub metrics: BTreeMap<String, f64>,
    /// ジョブ種別
    pub job_type: String,
    /// ログ（検証時にバイト上限で切り詰められる）
    pub logs: Vec<String>,
    /// ログ閲覧を許可するコンテナの一覧
    pub allowed_log_containers: Vec<String>,
}

/// asyncライフサイクルフック。
pub type AsyncLifecycleFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
/// blockingライフサイクルフック。
pub type BlockingLifecycleFn = Arc<dyn Fn(Context) -> anyhow::Result<()> + Send + Sync>;

/// ライフサイクルフックの実行形状。
#[derive(Clone)]
pub enum LifecycleHook {
    /// タスクとして実行
    Async(AsyncLifecycleFn),
    /// ワーカープールで実行
    Blocking(BlockingLifecycleFn),
}

/// asyncジョブハンドラ。
pub type AsyncJobFn = Arc<
    dyn Fn(Context, serde_json::Value) -> BoxFuture<'static, anyhow::Result<JobOutcome>>
        + Send
        + Sync,
>;
/// blockingジョブハンドラ。
pub type BlockingJobFn =
    Arc<dyn Fn(Context, serde_json::Value) -> anyhow::Result<JobOutcome> + Send + Sync>;

/// ジョブハンドラの実行形状。
#[derive(Clone)]
pub enum JobHandler {
    /// タスクとして実行
    Async(AsyncJobFn),
    /// ワーカープールで実行
    Blocking(BlockingJobFn),
}

/// async weightsハンドラ。ジョブ一覧からUID→重みを計算する。
pub type AsyncWeightsFn = Arc<
    dyn Fn(Vec<serde_json::Value>) -> BoxFuture<'static, anyhow::Result<BTreeMap<String, f64>>>
        + Send
        + Sync,
>;
/// blocking weightsハンドラ。
pub type BlockingWeightsFn = Arc<
    dyn Fn(Vec<serde_json::Value>) -> anyhow::Result<BTreeMap<String, f64>> + Send + Sync,
>;

/// weightsハンドラの実行形状。
#[derive(Clone)]
pub enum WeightsHandler {
    /// タスクとして実行
    Async(AsyncWeightsFn),
    /// ワーカープールで実行
    Blocking(BlockingWeightsFn),
}

/// async公開エンドポイントハンドラ。
pub type AsyncPublicFn = Arc<
    dyn Fn(PublicContext, serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
        + Send
        + Sync,
>;
/// blocking公開エンドポイントハンドラ。
pub type BlockingPublicFn = Arc<
    dyn Fn(PublicContext, serde_json::Value) -> anyhow::Result<serde_json::Value> + Send + Sync,
>;

/// 公開エンドポイントハンドラの実行形状。
#[derive(Clone)]
pub enum PublicHandler {
    /// タスクとして実行
    Async(AsyncPublicFn),
    /// ワーカープールで実行
    Blocking(BlockingPublicFn),
}

/// 登録フェーズのレジストリ。スレッドセーフではなく、`run()` 前にのみ触る。
#[derive(Default)]
pub struct ChallengeRegistry {
    on_startup: Option<LifecycleHook>,
    on_ready: Option<LifecycleHook>,
    on_cleanup: Option<LifecycleHook>,
    on_weights: Option<WeightsHandler>,
    job_handlers: HashMap<String, JobHandler>,
    default_job: Option<JobHandler>,
    public_handlers: HashMap<String, PublicHandler>,
    orm_policy: Option<crate::orm::OrmPolicy>,
}

impl ChallengeRegistry {
    /// 空のレジストリを作る。
    pub fn new() -> Self {
        Self::default()
    }

    /// startupフックを登録する。ピア接続の受け入れ開始前に一度だけ呼ばれる。
    pub fn register_startup(&mut self, hook: LifecycleHook) -> &mut Self {
        self.on_startup = Some(hook);
        self
    }

    /// readyフックを登録する。マイグレーションバリア通過後に呼ばれる。
    pub fn register_ready(&mut self, hook: LifecycleHook) -> &mut Self {
        self.on_ready = Some(hook);
        self
    }

    /// cleanupフックを登録する。ドレイン完了後に呼ばれる。
    pub fn register_cleanup(&mut self, hook: LifecycleHook) -> &mut Self {
        self.on_cleanup = Some(hook);
        self
    }

    /// weightsハンドラを登録する。未登録の場合は既定の計算が使われる。
    pub fn register_weights(&mut self, handler: WeightsHandler) -> &mut Self {
        self.on_weights = Some(handler);
        self
    }

    /// 名前付きジョブハンドラを登録する。
    pub fn register_job(&mut self, name: impl Into<String>, handler: JobHandler) -> &mut Self {
        self.job_handlers.insert(name.into(), handler);
        self
    }

    /// デフォルトジョブハンドラを登録する。
    pub fn register_default_job(&mut self, handler: JobHandler) -> &mut Self {
        self.default_job = Some(handler);
        self
    }

    /// 公開エンドポイントハンドラを登録する。
    pub fn register_public(
        &mut self,
        name: impl Into<String>,
        handler: PublicHandler,
    ) -> &mut Self {
        self.public_handlers.insert(name.into(), handler);
        self
    }

    /// `on_ready` 後に適用されるORMポリシーを設定する。
    pub fn set_orm_policy(&mut self, policy: crate::orm::OrmPolicy) -> &mut Self {
        self.orm_policy = Some(policy);
        self
    }

    /// レジストリを凍結する。以後の変更は不可能。
    pub fn freeze(self) -> Arc<FrozenRegistry> {
        Arc::new(FrozenRegistry {
            on_startup: self.on_startup,
            on_ready: self.on_ready,
            on_cleanup: self.on_cleanup,
            on_weights: self.on_weights,
            job_handlers: self.job_handlers,
            default_job: self.default_job,
            public_handlers: self.public_handlers,
            orm_policy: self.orm_policy,
        })
    }
}

/// 凍結済みレジストリ。`run()` から `Terminated` まで共有される。
pub struct FrozenRegistry {
    on_startup: Option<LifecycleHook>,
    on_ready: Option<LifecycleHook>,
    on_cleanup: Option<LifecycleHook>,
    on_weights: Option<WeightsHandler>,
    job_handlers: HashMap<String, JobHandler>,
    default_job: Option<JobHandler>,
    public_handlers: HashMap<String, PublicHandler>,
    orm_policy: Option<crate::orm::OrmPolicy>,
}

impl FrozenRegistry {
    /// startupフック。
    pub fn on_startup(&self) -> Option<&LifecycleHook> {
        self.on_startup.as_ref()
    }

    /// readyフック。
    pub fn on_ready(&self) -> Option<&LifecycleHook> {
        self.on_ready.as_ref()
    }

    /// cleanupフック。
    pub fn on_cleanup(&self) -> Option<&LifecycleHook> {
        self.on_cleanup.as_ref()
    }

    /// weightsハンドラ。
    pub fn on_weights(&self) -> Option<&WeightsHandler> {
        self.on_weights.as_ref()
    }

    /// ジョブハンドラを解決する。名前一致 → デフォルト → なし。
    pub fn resolve_job(&self, job_name: Option<&str>) -> Option<&JobHandler> {
        match job_name {
            Some(name) => self
                .job_handlers
                .get(name)
                .or(self.default_job.as_ref()),
            None => self.default_job.as_ref(),
        }
    }

    /// 公開エンドポイントハンドラを名前で解決する。
    pub fn resolve_public(&self, name: &str) -> Option<&PublicHandler> {
        self.public_handlers.get(name)
    }

    /// 登録済みORMポリシー。
    pub fn orm_policy(&self) -> Option<&crate::orm::OrmPolicy> {
        self.orm_policy.as_ref()
    }
}

/// ライフサイクルフックを実行形状に応じて起動する。
pub async fn invoke_lifecycle(hook: &LifecycleHook, ctx: Context) -> anyhow::Result<()> {
    match hook {
        LifecycleHook::Async(f) => f(ctx).await,
        LifecycleHook::Blocking(f) => {
            let f = Arc::clone(f);
            tokio::task::spawn_blocking(move || f(ctx))
                .await
                .map_err(|e| anyhow::anyhow!("ブロッキングフックの実行に失敗: {e}"))?
        }
    }
}

/// 既定のweights計算。各ジョブのuidにスコア（負値は0）を割り当てる。
pub fn default_weights(jobs: &[serde_json::Value]) -> BTreeMap<String, f64> {
    let mut weights = BTreeMap::new();
    for job in jobs {
        let uid = match job.get("uid") {
            Some(serde_json::Value::String(uid)) => uid.clone(),
            Some(serde_json::Value::Number(uid)) => uid.to_string(),
            _ => "0".to_string(),
        };
        let score = job
            .get("score")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        weights.insert(uid, score.max(0.0));
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_job(tag: &'static str) -> JobHandler {
        JobHandler::Blocking(Arc::new(move |_ctx, _payload| {
            Ok(JobOutcome {
                job_type: tag.to_string(),
                ..Default::default()
            })
        }))
    }

    /// ジョブ解決規則（名前一致 → デフォルト → なし）を確認
    #[test]
    fn test_job_resolution() {
        let mut registry = ChallengeRegistry::new();
        registry.register_job("evaluate", noop_job("named"));
        registry.register_default_job(noop_job("default"));
        let frozen = registry.freeze();

        assert!(frozen.resolve_job(Some("evaluate")).is_some());
        // 未知の名前はデフォルトへフォールバック
        assert!(frozen.resolve_job(Some("unknown")).is_some());
        assert!(frozen.resolve_job(None).is_some());

        let empty = ChallengeRegistry::new().freeze();
        assert!(empty.resolve_job(Some("evaluate")).is_none());
        assert!(empty.resolve_job(None).is_none());
    }

    /// 既定のweights計算を確認
    #[test]
    fn test_default_weights() {
        let jobs = vec![
            serde_json::json!({"uid": 1, "score": 0.8}),
            serde_json::json!({"uid": "2", "score": -0.5}),
            serde_json::json!({"score": 0.3}),
        ];
        let weights = default_weights(&jobs);
        assert_eq!(weights.get("1"), Some(&0.8));
        assert_eq!(weights.get("2"), Some(&0.0));
        assert_eq!(weights.get("0"), Some(&0.3));
    }

    /// 公開エンドポイントハンドラの解決を確認
    #[test]
    fn test_public_resolution() {
        let mut registry = ChallengeRegistry::new();
        registry.register_public(
            "leaderboard",
            PublicHandler::Blocking(Arc::new(|_ctx, _payload| Ok(serde_json::json!([])))),
        );
        let frozen = registry.freeze();
        assert!(frozen.resolve_public("leaderboard").is_some());
        assert!(frozen.resolve_public("unknown").is_none());
    }
}
