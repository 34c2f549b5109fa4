use tracing::info;

use super::{Step, StepAction, StepEnv, StepFuture, StepName};
use crate::cloud::{CloudApi, KeypairRequest};
use crate::context::{BuildContext, BuildKeypair, ContextField};
use crate::error::BuildError;
use crate::settings::KeySource;

/// Generates and uploads an ephemeral key unless the operator supplied one.
///
/// Only keys uploaded by this step are deleted during cleanup.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenerateOrImportKeypair;

impl<C> Step<C> for GenerateOrImportKeypair
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::GenerateOrImportKeypair
    }

    fn reads(&self) -> &'static [ContextField] {
        &[]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::Keypair]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let settings = env.settings;
            let keypair = match &settings.key_source {
                KeySource::Operator(key) => {
                    env.redactions.add(key.private_key.expose());
                    info!(key = %key.provider_key, "using operator ssh key");
                    BuildKeypair {
                        reference: key.provider_key.clone(),
                        private_key: key.private_key.clone(),
                        public_key: None,
                        uploaded: None,
                    }
                }
                KeySource::Generate => {
                    let material = env.keygen.generate(&settings.server_name).await?;
                    env.redactions.add(material.private_key.expose());
                    let request = KeypairRequest {
                        name: settings.server_name.clone(),
                        public_key: material.public_key.clone(),
                        labels: settings.key_labels.clone(),
                    };
                    let record = env
                        .api
                        .create_keypair(&request)
                        .await
                        .map_err(BuildError::request("create_keypair"))?;
                    info!(key = %record.id, name = %record.name, "uploaded temporary ssh key");
                    BuildKeypair {
                        reference: record.id.to_string(),
                        private_key: material.private_key,
                        public_key: Some(material.public_key),
                        uploaded: Some(record),
                    }
                }
            };
            ctx.set_keypair(keypair);
            Ok(StepAction::Continue)
        })
    }

    fn cleanup<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, (), C::Error> {
        Box::pin(async move {
            let Some(id) = ctx.keypair_opt().and_then(BuildKeypair::owned_id).cloned() else {
                return Ok(());
            };
            env.api
                .delete_keypair(&id)
                .await
                .map_err(BuildError::request("delete_keypair"))?;
            info!(key = %id, "deleted temporary ssh key");
            Ok(())
        })
    }
}
