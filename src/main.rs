use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::CustomResourceExt;
use prometheus::{Encoder, TextEncoder};

use fleet_extension_manager::{
    api::{
        backup_bucket::BackupBucket, deployment_binding::DeploymentBinding, extension::Extension,
        fleet_member::FleetMember, managed_resource::ManagedResource, registration::Registration,
    },
    config::ControllerConfig,
    controller, telemetry, State,
};

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
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

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        serde_yaml::to_string(&FleetMember::crd())?,
        serde_yaml::to_string(&Registration::crd())?,
        serde_yaml::to_string(&DeploymentBinding::crd())?,
        serde_yaml::to_string(&BackupBucket::crd())?,
        serde_yaml::to_string(&ManagedResource::crd())?,
        serde_yaml::to_string(&Extension::crd())?,
    ];
    println!("{}", crds.join("---\n"));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::parse();
    if config.crd {
        return print_crds();
    }

    telemetry::init(config.log_format)?;

    // Init k8s controller state
    let state = State::new()?;
    let metrics_addr = config.metrics_addr;
    let controllers = controller::run(state.clone(), config);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(metrics_addr)?
    .shutdown_timeout(5)
    .run();

    let (controllers, server) = tokio::join!(controllers, server);
    controllers?;
    server?;
    Ok(())
}
