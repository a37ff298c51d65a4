use crate::audit::AuditLogger;
use crate::auth::AuthStorage;
use crate::config::Config;
use crate::distributed::DistributedCluster;
use crate::ratelimit::RateLimiter;
use crate::skills::SkillRegistry;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared, request-spanning state. Per §5, the `Agent`/`Backend` pair is request-owned and
/// constructed fresh per call; only the admission-control and bookkeeping primitives here are
/// shared across concurrent handlers.
pub struct ServerState {
    pub config: Config,
    pub auth: Arc<AuthStorage>,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: Arc<AuditLogger>,
    pub cluster: Arc<DistributedCluster>,
    /// Built once at startup (§3: read-only, safe to share without per-request reconstruction).
    pub skills: Arc<SkillRegistry>,
    pub started_at: Instant,
    /// Tracks which model the local engine currently has loaded, so `/v1/distributed/*`
    /// handlers can report `is_loaded` and reject `generate` with `model_not_loaded` (§5).
    pub loaded_model: RwLock<Option<String>>,
}

impl ServerState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let secret = config.api.secret_key.as_ref().map(|s| s.as_bytes().to_vec());
        let auth = Arc::new(AuthStorage::new(secret));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit.tier));
        let audit = Arc::new(AuditLogger::new(
            &config.audit.log_dir,
            config.audit.max_file_mb,
            config.audit.backups,
        )?);
        let cluster = Arc::new(DistributedCluster::initialize_local(&config.api.host, config.api.port));
        let skills = Arc::new(SkillRegistry::load(&config.skills.mode, &config.skills.enabled));
        Ok(Self {
            config,
            auth,
            rate_limiter,
            audit,
            cluster,
            skills,
            started_at: Instant::now(),
            loaded_model: RwLock::new(None),
        })
    }

    /// Resolves the LLM provider (§4.1): `auto` probes MLX → Ollama → OpenAI-compat in order and
    /// constructs whichever answers first, falling back to Ollama's default URL if none do.
    pub async fn build_backend(&self) -> Box<dyn crate::backend::Backend> {
        let provider = if self.config.llm.provider == "auto" {
            let (detected, _) = crate::backend::auto_detect(None).await;
            detected
        } else {
            self.config.llm.provider.clone()
        };
        crate::backend::get_backend(
            &provider,
            Some(&self.config.llm.base_url),
            &self.config.llm.model,
            self.config.llm.api_key.clone(),
        )
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}
