use std::io::Write;

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 15] = [
    "LACUNA_LLM_PROVIDER",
    "LACUNA_LLM_BASE_URL",
    "LACUNA_LLM_API_KEY",
    "LACUNA_LLM_MODELS",
    "LACUNA_LLM_TIMEOUT",
    "LACUNA_EMBED_BACKEND",
    "LACUNA_EMBED_MODEL",
    "LACUNA_EMBED_DEVICE",
    "LACUNA_OLLAMA_URL",
    "LACUNA_LOG_LEVEL",
    "LACUNA_INDEX_BACKEND",
    "LACUNA_QDRANT_URL",
    "LACUNA_INDEX_COLLECTION",
    "LACUNA_INDEX_MAX_RETRIES",
    "LACUNA_RETRIEVAL_ANALYSIS_BUDGET",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn defaults_when_file_missing() {
    let config = Config::default();
    assert_eq!(config.llm.provider, ProviderKind::OpenAi);
    assert_eq!(config.llm.models[0], "gemini-2.5-flash");
    assert!((config.llm.temperature - 0.3).abs() < f32::EPSILON);
    assert_eq!(config.llm.max_tokens, 4096);
    assert_eq!(
        config.embedding.model,
        "sentence-transformers/all-MiniLM-L6-v2"
    );
    assert_eq!(config.index.backend, IndexBackend::Memory);
    assert_eq!(config.index.collection, "documents");
    assert_eq!(config.index.max_retries, 3);
    assert_eq!(config.chunking.chunk_size, 1000);
    assert_eq!(config.chunking.chunk_overlap, 200);
    assert_eq!(config.retrieval.analysis_budget, 6000);
    assert_eq!(config.retrieval.gap_budget, 1500);
    assert_eq!(config.tutor.history_messages, 10);
    assert_eq!(config.tutor.context_chars, 6000);
    assert_eq!(config.log.level, "info");
    config.validate().unwrap();
}

#[test]
#[serial]
fn load_missing_file_uses_defaults() {
    clear_env();
    let config = Config::load(std::path::Path::new("/nonexistent/lacuna.toml")).unwrap();
    assert_eq!(config.index.url, "http://localhost:6334");
}

#[test]
fn sample_config_matches_defaults() {
    let sample: Config =
        toml::from_str(include_str!("../../../../config/lacuna.toml")).unwrap();
    let defaults = Config::default();
    assert_eq!(sample.llm.models, defaults.llm.models);
    assert_eq!(sample.embedding.ollama_model, defaults.embedding.ollama_model);
    assert_eq!(sample.index.hnsw_search_ef, defaults.index.hnsw_search_ef);
    assert_eq!(sample.retrieval.gate_ceiling, defaults.retrieval.gate_ceiling);
    assert_eq!(sample.balance.min_gaps, defaults.balance.min_gaps);
    assert_eq!(sample.tutor.history_messages, defaults.tutor.history_messages);
    assert_eq!(sample.tutor.context_chars, defaults.tutor.context_chars);
    sample.validate().unwrap();
}

#[test]
#[serial]
fn load_partial_file_fills_defaults() {
    clear_env();
    let file = write_config(
        r#"
[llm]
provider = "ollama"
base_url = "http://localhost:11434"
models = ["llama3.2"]

[index]
backend = "qdrant"
hnsw_m = 48
"#,
    );
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.llm.models, vec!["llama3.2"]);
    assert_eq!(config.llm.max_tokens, 4096);
    assert_eq!(config.index.backend, IndexBackend::Qdrant);
    assert_eq!(config.index.hnsw().m, 48);
    assert_eq!(config.index.hnsw().ef_construct, 200);
    assert_eq!(config.chunking.chunk_size, 1000);
}

#[test]
#[serial]
fn malformed_file_is_an_error() {
    clear_env();
    let file = write_config("[llm\nprovider = ");
    assert!(Config::load(file.path()).is_err());
}

#[test]
#[serial]
fn env_overrides_take_precedence() {
    clear_env();
    let file = write_config("[index]\nurl = \"http://file:6334\"\n");
    unsafe {
        std::env::set_var("LACUNA_LLM_MODELS", "gemini-2.5-pro, ,gemini-2.0-flash");
        std::env::set_var("LACUNA_LLM_API_KEY", "secret");
        std::env::set_var("LACUNA_QDRANT_URL", "http://env:6334");
        std::env::set_var("LACUNA_EMBED_DEVICE", "cuda:1");
        std::env::set_var("LACUNA_INDEX_MAX_RETRIES", "5");
        std::env::set_var("LACUNA_INDEX_BACKEND", "Qdrant");
    }
    let config = Config::load(file.path()).unwrap();
    clear_env();

    assert_eq!(config.llm.models, vec!["gemini-2.5-pro", "gemini-2.0-flash"]);
    assert_eq!(config.llm.api_key.as_deref(), Some("secret"));
    assert_eq!(config.index.url, "http://env:6334");
    assert_eq!(config.embedding.device, "cuda:1");
    assert_eq!(config.index.max_retries, 5);
    assert_eq!(config.index.backend, IndexBackend::Qdrant);
}

#[test]
#[serial]
fn invalid_env_values_are_ignored() {
    clear_env();
    unsafe {
        std::env::set_var("LACUNA_INDEX_MAX_RETRIES", "many");
        std::env::set_var("LACUNA_LLM_PROVIDER", "carrier-pigeon");
    }
    let config = Config::load(std::path::Path::new("/nonexistent/lacuna.toml")).unwrap();
    clear_env();
    assert_eq!(config.index.max_retries, 3);
    assert_eq!(config.llm.provider, ProviderKind::OpenAi);
}

#[test]
#[serial]
fn api_key_is_never_serialized() {
    clear_env();
    let mut config = Config::default();
    config.llm.api_key = Some("secret".into());
    let text = toml::to_string(&config).unwrap();
    assert!(!text.contains("secret"));
}

#[test]
fn validate_rejects_bad_overlap() {
    let mut config = Config::default();
    config.chunking.chunk_overlap = config.chunking.chunk_size;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("chunk_overlap"));
    assert_eq!(err.kind(), "config");
}

#[test]
fn validate_rejects_zero_tutor_context() {
    let mut config = Config::default();
    config.tutor.context_chars = 0;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("tutor.context_chars"));
}

#[test]
fn validate_rejects_inverted_balance_band() {
    let mut config = Config::default();
    config.balance.min_critical_share = 0.7;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_unknown_device_and_empty_models() {
    let mut config = Config::default();
    config.embedding.device = "tpu".into();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.llm.models = vec![" ".into()];
    assert!(config.validate().is_err());
}

#[test]
fn index_section_converts() {
    let config = Config::default();
    let index = config.index.index_config();
    assert_eq!(index.collection, "documents");
    assert_eq!(index.base_backoff, std::time::Duration::from_millis(200));
    let chunker = config.chunking.chunker_config();
    assert_eq!(chunker.max_chunks, 400);
}
