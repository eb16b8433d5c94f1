//! Local HTTP fixtures standing in for provider APIs.

use axum::Router;
use tokio::net::TcpListener;

use crate::config::ProviderSettings;

/// Serves `router` on an ephemeral port and returns its base URL.
pub(crate) async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock provider");
    let addr = listener.local_addr().expect("mock provider addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock provider");
    });
    format!("http://{addr}/v1")
}

/// Provider settings pointing at a mock server.
pub(crate) fn provider(base_url: &str, model: &str) -> ProviderSettings {
    ProviderSettings::new("sk-test", base_url, model).expect("mock provider settings")
}
