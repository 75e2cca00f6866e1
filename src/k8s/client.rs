// Client creation from tenant kubeconfigs, with custom user-agent support for kube 2.x
use crate::error::{Error, Result};
use hyper::http::{HeaderName, HeaderValue};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::warn;

/// Attach a `user-agent` header to every request made with `config`.
/// Returns `false` (keeping kube's default) when the value is not a valid
/// header.
pub fn add_user_agent_header(config: &mut Config, user_agent: Option<&str>) -> bool {
    let Some(user_agent) = user_agent else {
        return false;
    };
    match HeaderValue::from_str(user_agent) {
        Ok(value) => {
            config
                .headers
                .push((HeaderName::from_static("user-agent"), value));
            true
        }
        Err(_) => {
            warn!("Invalid user agent {:?}, using the default", user_agent);
            false
        }
    }
}

/// Build a client for one context of a kubeconfig document
///
/// # Errors
///
/// Returns `ConfigNotFound` if the context does not exist, or the kubeconfig
/// and client errors raised while building it
pub async fn for_context(kubeconfig: Kubeconfig, context: &str, user_agent: Option<&str>) -> Result<Client> {
    if !kubeconfig.contexts.iter().any(|c| c.name == context) {
        return Err(Error::ConfigNotFound(format!("context {context}")));
    }

    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..KubeConfigOptions::default()
    };
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
    add_user_agent_header(&mut config, user_agent);

    Ok(Client::try_from(config)?)
}
