use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mail_assist::config::{AiConfig, AlertConfig, PipelineConfig, ServerConfig};
use mail_assist::llm::create_provider;
use mail_assist::pipeline::alert::{Alerter, LogAlerter, SmtpAlerter};
use mail_assist::pipeline::classifier::{ClassifierRegistry, LlmClassifier};
use mail_assist::pipeline::scheduler::{parse_schedule, spawn_reconciler};
use mail_assist::pipeline::webhook::{WebhookState, routes};
use mail_assist::pipeline::{Dispatcher, MessagePipeline};
use mail_assist::providers::gmail::GmailAdapter;
use mail_assist::providers::graph::{GraphAdapter, GraphNotifications};
use mail_assist::providers::imap::{ImapAdapter, ImapConfig};
use mail_assist::providers::{AdapterSet, CredentialSource, StaticCredentials};
use mail_assist::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Warning: a rustls crypto provider was already installed");
    }

    let server_config = ServerConfig::from_env();

    // ── Tracing ─────────────────────────────────────────────────────────
    let (file_layer, _log_guard) = match &server_config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let pipeline_config = PipelineConfig::from_env();
    let ai_config = AiConfig::from_env();
    ai_config.validate()?;

    eprintln!("📬 Mail Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/gmail", server_config.port);
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/microsoft", server_config.port);
    eprintln!(
        "   Workers: {} (attempts {}, timeout {}s)",
        pipeline_config.workers,
        pipeline_config.max_attempts,
        pipeline_config.message_timeout.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server_config.db_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", server_config.db_path.display())
            })?,
    );
    eprintln!("   Database: {}", server_config.db_path.display());

    // ── Providers ────────────────────────────────────────────────────────
    let graph_notifications = match (
        &server_config.graph_notification_url,
        &server_config.graph_client_state,
    ) {
        (Some(url), Some(client_state)) => Some(GraphNotifications {
            url: url.clone(),
            client_state: client_state.clone(),
        }),
        _ => None,
    };
    let credentials: Arc<dyn CredentialSource> = Arc::new(StaticCredentials::from_env());
    let adapters = AdapterSet::new()
        .with(Arc::new(GmailAdapter::new(
            Arc::clone(&credentials),
            server_config.gmail_topic.clone(),
        )))
        .with(Arc::new(
            GraphAdapter::new(Arc::clone(&credentials)).with_notifications(graph_notifications),
        ))
        .with(Arc::new(ImapAdapter::new(
            ImapConfig::from_env(),
            Arc::clone(&credentials),
        )));

    // ── Classifiers ──────────────────────────────────────────────────────
    let mut classifiers = ClassifierRegistry::new();
    for backend in &ai_config.backends {
        let llm = create_provider(backend)?;
        classifiers.register(Arc::new(LlmClassifier::new(backend.backend.key(), llm)));
    }
    if let Some(default) = &ai_config.default_backend {
        classifiers.set_default(default)?;
    }
    eprintln!("   Classifiers: {}", classifiers.keys().join(", "));

    // ── Alerts ───────────────────────────────────────────────────────────
    let alerter: Arc<dyn Alerter> = match AlertConfig::from_env() {
        Some(config) => {
            eprintln!("   Alerts: SMTP via {} to {}", config.smtp_host, config.recipients.join(", "));
            Arc::new(SmtpAlerter::new(config))
        }
        None => {
            eprintln!("   Alerts: log only");
            Arc::new(LogAlerter)
        }
    };

    let reconcile_cron = pipeline_config.reconcile_cron.clone();
    let pipeline = Arc::new(MessagePipeline::new(
        db,
        adapters,
        credentials,
        classifiers,
        alerter,
        pipeline_config,
    ));
    let dispatcher = Dispatcher::new(pipeline);

    // ── Reconciler ───────────────────────────────────────────────────────
    let _reconciler = match reconcile_cron {
        Some(expr) => {
            let schedule = parse_schedule(&expr)?;
            eprintln!("   Reconcile: {expr}");
            Some(spawn_reconciler(dispatcher.clone(), schedule))
        }
        None => {
            eprintln!("   Reconcile: on demand only");
            None
        }
    };

    if server_config.admin_token.is_none() {
        eprintln!("   Admin routes: disabled (MAIL_ASSIST_ADMIN_TOKEN unset)");
    }
    eprintln!();

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = routes(
        WebhookState::new(dispatcher, server_config.admin_token.clone())
            .with_graph_client_state(server_config.graph_client_state.clone()),
    );
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port))
        .await
        .with_context(|| format!("failed to bind port {}", server_config.port))?;
    tracing::info!(port = server_config.port, "Webhook server started");
    axum::serve(listener, app).await?;

    Ok(())
}
