use super::Config;

fn parse_kind<T: serde::de::DeserializeOwned>(key: &str, v: &str) -> Option<T> {
    if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.to_ascii_lowercase())) {
        Some(kind)
    } else {
        tracing::warn!("ignoring invalid {key} value: {v}");
        None
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_index();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Ok(v) = std::env::var("LACUNA_LLM_PROVIDER")
            && let Some(kind) = parse_kind("LACUNA_LLM_PROVIDER", &v)
        {
            self.llm.provider = kind;
        }
        if let Ok(v) = std::env::var("LACUNA_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("LACUNA_LLM_API_KEY")
            && !v.trim().is_empty()
        {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("LACUNA_LLM_MODELS") {
            let models: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !models.is_empty() {
                self.llm.models = models;
            }
        }
        if let Ok(v) = std::env::var("LACUNA_LLM_TIMEOUT")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.llm.timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("LACUNA_EMBED_BACKEND")
            && let Some(kind) = parse_kind("LACUNA_EMBED_BACKEND", &v)
        {
            self.embedding.backend = kind;
        }
        if let Ok(v) = std::env::var("LACUNA_EMBED_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("LACUNA_EMBED_DEVICE") {
            self.embedding.device = v;
        }
        if let Ok(v) = std::env::var("LACUNA_OLLAMA_URL") {
            self.embedding.ollama_url = v;
        }
        if let Ok(v) = std::env::var("LACUNA_LOG_LEVEL") {
            self.log.level = v;
        }
    }

    fn apply_env_overrides_index(&mut self) {
        if let Ok(v) = std::env::var("LACUNA_INDEX_BACKEND")
            && let Some(kind) = parse_kind("LACUNA_INDEX_BACKEND", &v)
        {
            self.index.backend = kind;
        }
        if let Ok(v) = std::env::var("LACUNA_QDRANT_URL") {
            self.index.url = v;
        }
        if let Ok(v) = std::env::var("LACUNA_INDEX_COLLECTION") {
            self.index.collection = v;
        }
        if let Ok(v) = std::env::var("LACUNA_INDEX_MAX_RETRIES")
            && let Ok(n) = v.parse::<u32>()
        {
            self.index.max_retries = n;
        }
        if let Ok(v) = std::env::var("LACUNA_RETRIEVAL_ANALYSIS_BUDGET")
            && let Ok(n) = v.parse::<usize>()
        {
            self.retrieval.analysis_budget = n;
        }
    }
}
