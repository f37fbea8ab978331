//! Toolchain image recipe.

use crate::config::ToolchainImage;

/// One binary copied out of a named build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryCopy {
    /// Build stage name.
    pub stage: String,
    /// Image the stage is based on.
    pub image: String,
    /// Path of the binary in that image.
    pub source: String,
    /// Install path in the final image.
    pub target: String,
}

/// Multi-stage build copying client binaries onto a minimal base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecipe {
    /// Tag for the built image.
    pub tag: String,
    /// Final base image.
    pub base: String,
    /// Binaries copied into the final stage.
    pub copies: Vec<BinaryCopy>,
    /// Packages installed with `apk`.
    pub packages: Vec<String>,
}

impl ImageRecipe {
    /// Renders the Dockerfile fed to the build on stdin.
    pub fn render_dockerfile(&self) -> String {
        let mut lines = Vec::new();

        for copy in &self.copies {
            lines.push(format!("FROM {} AS {}", copy.image, copy.stage));
        }
        lines.push(format!("FROM {}", self.base));
        for copy in &self.copies {
            lines.push(format!(
                "COPY --from={} {} {}",
                copy.stage, copy.source, copy.target
            ));
        }
        if !self.packages.is_empty() {
            lines.push(format!("RUN apk add --no-cache {}", self.packages.join(" ")));
        }

        let mut dockerfile = lines.join("\n");
        dockerfile.push('\n');
        dockerfile
    }
}

impl From<&ToolchainImage> for ImageRecipe {
    fn from(image: &ToolchainImage) -> Self {
        Self {
            tag: image.tag.clone(),
            base: image.base.clone(),
            copies: image
                .binaries
                .iter()
                .map(|binary| BinaryCopy {
                    stage: format!("{}-src", binary.name),
                    image: binary.image.clone(),
                    source: binary.path.clone(),
                    target: format!("/usr/local/bin/{}", binary.name),
                })
                .collect(),
            packages: image.packages.clone(),
        }
    }
}
