//! SPIR-V loaded from a directory of compiled shaders.

use std::fs::File;
use std::path::PathBuf;

use vkproc_backend::{shader_file_name, BackendError, ShaderSource, ShaderStage};

/// Reads `<dir>/<name>.<stage>.spv`.
pub struct ShaderDirectory {
    dir: PathBuf,
}

impl ShaderDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ShaderSource for ShaderDirectory {
    fn load(&self, name: &str, stage: ShaderStage) -> vkproc_backend::Result<Vec<u32>> {
        let file_name = shader_file_name(name, stage);
        let path = self.dir.join(&file_name);
        let unavailable = |reason: String| BackendError::Shader {
            name: file_name.clone(),
            reason,
        };
        let mut file = File::open(&path).map_err(|e| unavailable(format!("{}: {e}", path.display())))?;
        ash::util::read_spv(&mut file).map_err(|e| unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_shaders_name_the_file() {
        let shaders = ShaderDirectory::new("/nonexistent-shader-dir");
        let err = shaders.load("prim", ShaderStage::Vertex).unwrap_err();
        match err {
            BackendError::Shader { name, .. } => assert_eq!(name, "prim.vert.spv"),
            other => panic!("unexpected error {other}"),
        }
    }
}
