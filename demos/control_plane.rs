//! Runs the cluster control plane against the admin cluster of the current environment.
//!
//! ```sh
//! RUST_LOG=info cargo run --example control_plane -- settings.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use multikube::bootstrap::ensure_admin_declaration;
use multikube::bootstrap::AdminConnection;
use multikube::config::Settings;
use multikube::controller::ClusterController;
use multikube::controller::ControlPlaneContext;
use multikube::events::EventRecorder;
use multikube::k8s::K8sRepository;
use multikube::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings_path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = Settings::load(settings_path.as_deref())?;

    let admin = AdminConnection::load(settings.admin.kubeconfig.as_deref()).await?;
    admin.probe(settings.controller.probe_timeout()).await?;

    let repository = Arc::new(K8sRepository::new(admin.client()));
    match admin.kubeconfig() {
        Some(kubeconfig) => {
            let outcome = ensure_admin_declaration(repository.as_ref(), &settings.admin, kubeconfig).await?;
            tracing::info!(?outcome, cluster = %settings.admin.name, "Admin cluster declaration ensured");
        }
        None => tracing::warn!("Running in-cluster without a kubeconfig, admin cluster is not declared"),
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "Unable to listen for shutdown signal");
            }
            shutdown.cancel();
        }
    });

    let registry = Registry::new();
    let recorder = Arc::new(EventRecorder::new(
        admin.client(),
        settings.controller.event_namespace.clone(),
        settings.controller.component.clone(),
    ));
    let context = ControlPlaneContext::new(registry, Arc::clone(&repository), recorder, shutdown);
    let controller = Arc::new(ClusterController::new(Arc::new(context), settings.controller.clone()));

    controller.run(repository.api().clone()).await;
    Ok(())
}
