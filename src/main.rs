use std::sync::Arc;

use mailsieve::classifier::{NoopClassifier, OpenAiClassifier, RuleClassifier};
use mailsieve::config::{
    ClassifierConfig, GoogleOauthConfig, MasterKeyConfig, MicrosoftOauthConfig, PipelineConfig,
    WatchConfig,
};
use mailsieve::crypto::{KeyWrapper, LocalKeyWrapper, TokenCipher, VaultKeyWrapper};
use mailsieve::pipeline::MessageProcessor;
use mailsieve::providers::{GmailProvider, GraphProvider, ProviderRegistry};
use mailsieve::server::{AppState, ingress_routes};
use mailsieve::store::{LibSqlStore, Store};
use mailsieve::tokens::TokenResolver;
use mailsieve::watch::{WatchRenewer, spawn_watch_renewal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let port: u16 = std::env::var("MAILSIEVE_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let master_key = MasterKeyConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export MAILSIEVE_LOCAL_MASTER_KEY=<base64 of 32 random bytes> (dev)");
        eprintln!("  or VAULT_ADDR + VAULT_TOKEN [+ VAULT_TRANSIT_KEY]");
        std::process::exit(1);
    });

    let pipeline_config = PipelineConfig::from_env();
    let watch_config = WatchConfig::from_env();
    let classifier_config = ClassifierConfig::from_env();
    let google_oauth = GoogleOauthConfig::from_env();
    let ms_oauth = MicrosoftOauthConfig::from_env();

    eprintln!("📬 mailsieve v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Process API: http://0.0.0.0:{port}/api/process");
    eprintln!("   Gmail webhook: http://0.0.0.0:{port}/webhook/gmail");

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("MAILSIEVE_DB_PATH").unwrap_or_else(|_| "./data/mailsieve.db".to_string());
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", db_path);

    // ── Token encryption ─────────────────────────────────────────────────
    let wrapper: Arc<dyn KeyWrapper> = match master_key {
        MasterKeyConfig::Vault {
            addr,
            token,
            key_name,
        } => {
            eprintln!("   Master key: Vault transit ({})", key_name);
            Arc::new(VaultKeyWrapper::new(addr, token, key_name))
        }
        MasterKeyConfig::Local { key_base64 } => {
            eprintln!("   Master key: local (INSECURE, dev only)");
            Arc::new(LocalKeyWrapper::from_config(&key_base64).unwrap_or_else(|e| {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }))
        }
    };
    let cipher = Arc::new(TokenCipher::new(wrapper));

    // ── Providers ────────────────────────────────────────────────────────
    eprintln!(
        "   Token refresh: Gmail {}, M365 {}",
        if google_oauth.is_some() { "on" } else { "off" },
        if ms_oauth.is_some() { "on" } else { "off" },
    );
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(GmailProvider::new(
        google_oauth,
        watch_config.pubsub_topic.clone(),
    )));
    registry.register(Arc::new(GraphProvider::new(ms_oauth)));
    let registry = Arc::new(registry);

    let tokens = Arc::new(TokenResolver::new(
        store.clone(),
        cipher.clone(),
        registry.clone(),
    ));

    // ── Classifier ───────────────────────────────────────────────────────
    let classifier: Arc<dyn RuleClassifier> = match classifier_config {
        Some(config) => {
            eprintln!("   Classifier: {}", config.url);
            Arc::new(OpenAiClassifier::new(config))
        }
        None => {
            eprintln!("   Classifier: disabled (every message files as NONE)");
            Arc::new(NoopClassifier)
        }
    };

    let processor = Arc::new(MessageProcessor::new(
        store.clone(),
        tokens.clone(),
        registry.clone(),
        classifier,
        pipeline_config,
    ));

    // ── Watch renewal ────────────────────────────────────────────────────
    match &watch_config.pubsub_topic {
        Some(topic) => eprintln!(
            "   Gmail watch: {} (cron {})",
            topic, watch_config.renewal_cron
        ),
        None => eprintln!("   Gmail watch: disabled (no Pub/Sub topic)"),
    }
    let renewer = Arc::new(WatchRenewer::new(
        store.clone(),
        tokens.clone(),
        registry.clone(),
        watch_config,
    ));
    let (_renewal_handle, _renewal_shutdown) = spawn_watch_renewal(renewer);

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = ingress_routes(AppState {
        store,
        tokens,
        registry,
        processor,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "mailsieve listening");
    axum::serve(listener, app).await?;

    Ok(())
}
