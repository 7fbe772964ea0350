use crate::{
    config::ProviderConfig, engine::SandboxProvider, native::NativeKernelProvider,
    remote::RemoteProvider, Result,
};
use std::sync::Arc;
use tracing::info;

/// Build the sandbox backend described by `config`.
///
/// Construction is cheap and never contacts a service: a remote backend
/// without an API key still builds, and reports the missing key on the first
/// sandbox it is asked to provision.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn SandboxProvider>> {
    info!("[SANDBOX] Using {}", config.description());

    let provider: Arc<dyn SandboxProvider> = match config {
        ProviderConfig::Remote {
            api_url,
            api_key,
            template,
            sandbox_timeout,
            workspace_root,
        } => Arc::new(RemoteProvider::new(
            api_url.clone(),
            api_key.clone(),
            template.clone(),
            *sandbox_timeout,
            workspace_root.clone(),
        )),
        ProviderConfig::Native {
            python_path,
            workspace_base,
            limits,
            import_policy,
        } => {
            let provider = NativeKernelProvider::new(
                python_path.clone(),
                workspace_base.clone(),
                limits.clone(),
                import_policy.clone(),
            )?;
            info!("[SANDBOX] Python interpreter: {}", provider.python_path().display());
            Arc::new(provider)
        }
        #[cfg(feature = "microsandbox-engine")]
        ProviderConfig::Microsandbox { image, memory_mb } => Arc::new(
            crate::microsandbox_engine::MicrosandboxProvider::new(image.clone(), *memory_mb),
        ),
        #[cfg(not(feature = "microsandbox-engine"))]
        ProviderConfig::Microsandbox { .. } => {
            return Err(crate::SandboxError::Provisioning(
                "microsandbox support not compiled in (enable the microsandbox-engine feature)"
                    .to_string(),
            ))
        }
    };

    Ok(provider)
}
