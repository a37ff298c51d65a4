use super::{Backend, MlxBackend, OllamaBackend, OpenAiCompatBackend};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MLX_DEFAULT_URL: &str = "http://localhost:8080/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const LMSTUDIO_DEFAULT_URL: &str = "http://localhost:1234/v1";

/// Mirrors `backends/auto.py::auto_detect_backend`: try the caller's preference first, then
/// probe MLX, Ollama, and an OpenAI-compatible local server (e.g. LM Studio) in that order.
/// Returns the detected provider name and a small JSON blob describing how it was reached.
pub async fn auto_detect(preferred: Option<&str>) -> (String, serde_json::Value) {
    if let Some(name) = preferred {
        if probe(name).await {
            return (name.to_string(), serde_json::json!({"source": "preferred"}));
        }
        tracing::warn!(backend = name, "preferred backend unavailable, falling back to autodetect");
    }

    for candidate in ["mlx", "ollama", "openai"] {
        if probe(candidate).await {
            return (candidate.to_string(), serde_json::json!({"source": "autodetect"}));
        }
    }

    ("none".to_string(), serde_json::json!({"source": "autodetect", "reason": "no backend reachable"}))
}

async fn probe(name: &str) -> bool {
    let check = async {
        match name {
            "mlx" => OpenAiCompatBackend::new(MLX_DEFAULT_URL, "", None).is_available().await,
            "ollama" => OllamaBackend::new(OLLAMA_DEFAULT_URL, "").is_available().await,
            "openai" | "lmstudio" => OpenAiCompatBackend::new(LMSTUDIO_DEFAULT_URL, "", None).is_available().await,
            _ => false,
        }
    };
    tokio::time::timeout(PROBE_TIMEOUT, check).await.unwrap_or(false)
}

/// Factory mirroring `backends/auto.py::get_backend`: construct the concrete backend for a
/// resolved provider name, given a base URL and model override (falling back to each
/// provider's documented default).
pub fn get_backend(
    provider: &str,
    base_url: Option<&str>,
    model: &str,
    api_key: Option<String>,
) -> Box<dyn Backend> {
    match provider {
        "mlx" => Box::new(MlxBackend::new(base_url.unwrap_or(MLX_DEFAULT_URL), model)),
        "ollama" => Box::new(OllamaBackend::new(base_url.unwrap_or(OLLAMA_DEFAULT_URL), model)),
        "openai" | "lmstudio" => Box::new(OpenAiCompatBackend::new(
            base_url.unwrap_or(LMSTUDIO_DEFAULT_URL),
            model,
            api_key,
        )),
        other => {
            tracing::warn!(provider = other, "unknown backend provider, defaulting to ollama");
            Box::new(OllamaBackend::new(base_url.unwrap_or(OLLAMA_DEFAULT_URL), model))
        }
    }
}
