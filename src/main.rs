use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};

use sandbox_operator::controllers::{sandbox, PullSecretConfig};
use sandbox_operator::subjects::{DirectoryConfig, GraphDirectory, SubjectResolver};
use sandbox_operator::{telemetry, Metrics, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Tenant of the user directory; owners are bound by their directory object id when set
    #[arg(long = "azure-tenant-id", env = "AZURE_TENANT_ID", value_name = "TENANT")]
    azure_tenant_id: Option<String>,

    #[arg(long = "azure-client-id", env = "AZURE_CLIENT_ID", value_name = "CLIENTID")]
    azure_client_id: Option<String>,

    #[arg(
        long = "azure-client-secret",
        env = "AZURE_CLIENT_SECRET",
        value_name = "SECRET",
        hide_env_values = true
    )]
    azure_client_secret: Option<String>,

    #[arg(
        long = "azure-authority-host",
        env = "AZURE_AUTHORITY_HOST",
        value_name = "URL",
        default_value = "https://login.microsoftonline.com"
    )]
    azure_authority_host: String,

    #[arg(
        long = "graph-endpoint",
        env = "GRAPH_ENDPOINT",
        value_name = "URL",
        default_value = "https://graph.microsoft.com"
    )]
    graph_endpoint: String,

    /// Image pull secret to copy into every sandbox namespace
    #[arg(long = "pull-secret-name", env = "PULL_SECRET_NAME", value_name = "NAME")]
    pull_secret_name: Option<String>,

    #[arg(
        long = "pull-secret-namespace",
        env = "PULL_SECRET_NAMESPACE",
        value_name = "NAMESPACE"
    )]
    pull_secret_namespace: Option<String>,

    #[arg(
        long = "request-timeout-seconds",
        env = "REQUEST_TIMEOUT_SECONDS",
        value_name = "SECONDS",
        default_value_t = 30
    )]
    request_timeout_seconds: u64,

    #[arg(
        long = "bind-address",
        env = "BIND_ADDRESS",
        value_name = "ADDRESS",
        default_value = "0.0.0.0:8080"
    )]
    bind_address: String,

    #[arg(long = "log-format", env = "LOG_FORMAT", value_name = "FORMAT", default_value = "text")]
    log_format: String,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

async fn subject_resolver(args: &Arguments, timeout: Duration) -> anyhow::Result<SubjectResolver> {
    let config = DirectoryConfig::from_parts(
        args.azure_tenant_id.clone(),
        args.azure_client_id.clone(),
        args.azure_client_secret.clone(),
        args.azure_authority_host.clone(),
        args.graph_endpoint.clone(),
        timeout,
    )?;

    match config {
        Some(config) => {
            let directory = GraphDirectory::connect(config).await.inspect_err(|e| {
                error!("Could not connect to the user directory: {e}");
            })?;
            Ok(SubjectResolver::Directory(Arc::new(directory)))
        }
        None => Ok(SubjectResolver::Passthrough),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();

    telemetry::init(args.log_format.eq_ignore_ascii_case("json")).await;

    let request_timeout = Duration::from_secs(args.request_timeout_seconds);
    let subject_resolver = subject_resolver(&args, request_timeout).await?;
    let pull_secret = PullSecretConfig::from_parts(
        args.pull_secret_name.clone(),
        args.pull_secret_namespace.clone(),
    );
    info!(
        "Binding owners with the {} subject resolver",
        subject_resolver.name()
    );
    if let Some(pull_secret) = &pull_secret {
        info!(
            "Copying pull secret {}/{} into sandboxes",
            pull_secret.namespace, pull_secret.name
        );
    }

    // Initialize Kubernetes controller state
    let state = State::new(subject_resolver, pull_secret, request_timeout);
    let client = Client::try_default().await?;
    let operator_metrics = Metrics::default().register(&state.registry)?;
    let controller = sandbox::run(client, operator_metrics, state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
