use std::{env::consts::{DLL_PREFIX, DLL_SUFFIX}, error::Error};

use camino::{Utf8Path, Utf8PathBuf};
use log::{error, info};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};

/// Sets up ONNX Runtime for the SigLIP2 embedder, once per process and before the first model is loaded.
///
/// Inference runs on the CPU, with CUDA tried first when built with the `cuda` feature. The runtime library is
/// loaded from `onnx_lib_dir` (the `onnx_library_directory` setting) if given, otherwise from the system's
/// library search path.
pub fn init_ort(onnx_lib_dir: Option<&Utf8Path>) -> Result<(), Box<dyn Error>> {
    let builder = match onnx_lib_dir {
        Some(dir) => {
            let library = runtime_library(dir);
            info!("Loading ONNX Runtime from {}", library);
            ort::init_from(library)
        },
        None => ort::init(),
    };

    builder.with_execution_providers(execution_providers()).commit()
        .map(|_| info!("ONNX Runtime initialized"))
        .map_err(|e| {
            error!("Failed to initialize ONNX Runtime: {}", e);
            e.into()
        })
}

fn runtime_library(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join(format!("{DLL_PREFIX}onnxruntime{DLL_SUFFIX}"))
}

fn execution_providers() -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::new();
    #[cfg(feature = "cuda")]
    providers.push(ort::execution_providers::CUDAExecutionProvider::default().build().error_on_failure());
    providers.push(CPUExecutionProvider::default().build());
    providers
}
