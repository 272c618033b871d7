//! Context wiring for the resource provider.

use crate::{ProviderConfig, ResourceProvider, TargetMount};
use kiln_base::intern;
use kiln_context::{Context, HotReloadSystem, System, SystemApi, SystemCreateContext, UpdateSystem};
use kiln_resource::CodecRegistry;
use std::sync::Arc;

/// Configuration handed to the provider system through the context request.
#[derive(Clone)]
pub struct ProviderSystemConfig {
    pub codecs: Arc<CodecRegistry>,
    pub mounts: Vec<TargetMount>,
    pub config: ProviderConfig,
}

/// System wrapper running the provider every tick, after the hot-reload
/// coordinator has advanced its state machine.
pub struct ResourceProviderSystem {
    provider: ResourceProvider,
}

fn create_provider_system(context: &SystemCreateContext) -> Arc<dyn System> {
    let config = context
        .config_as::<ProviderSystemConfig>()
        .cloned()
        .unwrap_or_else(|| ProviderSystemConfig {
            codecs: Arc::new(CodecRegistry::new()),
            mounts: Vec::new(),
            config: ProviderConfig::default(),
        });

    Arc::new(ResourceProviderSystem {
        provider: ResourceProvider::new(config.codecs, config.mounts, config.config),
    })
}

static PROVIDER_SYSTEM_API: SystemApi = SystemApi {
    name: ResourceProviderSystem::NAME,
    create: create_provider_system,
};

impl ResourceProviderSystem {
    pub const NAME: &'static str = "resource_provider_system";

    pub fn api() -> &'static SystemApi {
        &PROVIDER_SYSTEM_API
    }

    pub fn provider(&self) -> &ResourceProvider {
        &self.provider
    }
}

impl System for ResourceProviderSystem {
    fn connect(&self, context: &Context) {
        let coordination = context.query_typed::<HotReloadSystem>(HotReloadSystem::NAME);
        if let Some(update) = context.query_typed::<UpdateSystem>(UpdateSystem::NAME) {
            if let Some(me) =
                context.query_no_connect_typed::<ResourceProviderSystem>(Self::NAME)
            {
                update.connect_on_run(
                    intern(Self::NAME),
                    &[intern(HotReloadSystem::NAME)],
                    move || me.provider.update(coordination.as_deref()),
                );
            }
        }
    }

    fn disconnect(&self, context: &Context) {
        if let Some(update) = context.query_no_connect_typed::<UpdateSystem>(UpdateSystem::NAME) {
            update.disconnect_on_run(intern(Self::NAME));
        }
    }
}
