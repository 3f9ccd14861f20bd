use crate::executor::Executor;
use crate::ExecError;
use boxforge_schema::Fingerprint;
use tracing::{debug, info};

impl Executor {
    /// Look for a layer already built for `fingerprint` on top of the current
    /// image. On a hit the found image becomes the resulting image and its
    /// recorded configuration is adopted. The first match in engine order
    /// wins.
    pub fn check_cache(&mut self, fingerprint: &Fingerprint) -> Result<bool, ExecError> {
        if !self.state.use_cache {
            return Ok(false);
        }
        let Some(current) = self.state.resulting_image.clone() else {
            return Ok(false);
        };

        let images = self.engine.list_images()?;
        for child in images.iter().filter(|img| img.parent_id == current.as_str()) {
            let record = self.engine.inspect_image(&child.id)?;
            if record.comment != fingerprint.as_str() {
                continue;
            }
            info!("using cache for '{fingerprint}': {}", record.id.short());
            if let Some(config) = &record.config {
                self.state.config.merge_container_config(config);
            }
            self.state.resulting_image = Some(record.id);
            return Ok(true);
        }

        debug!("cache miss for '{fingerprint}'");
        Ok(false)
    }
}
