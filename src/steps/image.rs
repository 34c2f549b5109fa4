use tracing::{debug, info};

use super::{Step, StepAction, StepEnv, StepFuture, StepName};
use crate::cloud::{CloudApi, ImageQuery, ImageRecord};
use crate::context::{BuildContext, ContextField};
use crate::error::BuildError;
use crate::settings::{ImageFilter, ImageSelection};

/// Resolves the image the server boots from.
///
/// Direct selections pass through without contacting the provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveImage;

impl<C> Step<C> for ResolveImage
where
    C: CloudApi + Send + Sync,
{
    fn name(&self) -> StepName {
        StepName::ResolveImage
    }

    fn reads(&self) -> &'static [ContextField] {
        &[]
    }

    fn writes(&self) -> &'static [ContextField] {
        &[ContextField::SourceImage]
    }

    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildContext,
        env: &'a StepEnv<'a, C>,
    ) -> StepFuture<'a, StepAction, C::Error> {
        Box::pin(async move {
            let image = match &env.settings.image {
                ImageSelection::Direct(image) => image.clone(),
                ImageSelection::Filter(filter) => {
                    let query = ImageQuery {
                        label_selector: filter.with_selector.clone(),
                    };
                    let candidates = env
                        .api
                        .list_images(&query)
                        .await
                        .map_err(BuildError::request("list_images"))?;
                    debug!(
                        selector = %filter.with_selector,
                        candidates = candidates.len(),
                        "listed images"
                    );
                    select_image::<C::Error>(candidates, filter)?.id.to_string()
                }
            };
            info!(image = %image, "resolved source image");
            ctx.set_source_image(image);
            Ok(StepAction::Continue)
        })
    }
}

/// Picks one image from the candidates matching `filter`.
///
/// # Errors
///
/// Returns [`BuildError::NoMatchingImage`] when there are no candidates and
/// [`BuildError::AmbiguousImage`] when several match but `most_recent` is not
/// set.
pub fn select_image<E>(
    candidates: Vec<ImageRecord>,
    filter: &ImageFilter,
) -> Result<ImageRecord, BuildError<E>>
where
    E: std::error::Error + 'static,
{
    let count = candidates.len();
    if count > 1 && !filter.most_recent {
        return Err(BuildError::AmbiguousImage {
            selector: filter.with_selector.clone(),
            count,
        });
    }
    candidates
        .into_iter()
        .max_by_key(|image| image.created)
        .ok_or_else(|| BuildError::NoMatchingImage {
            selector: filter.with_selector.clone(),
        })
}
