//! Build script for vecscan.
//!
//! The default build has no native requirements: the engine runs against the
//! host-emulated device runtime. With `--features cuda` the crate links the
//! CUDA driver and cuBLAS through cudarc, which expects a CUDA toolkit at
//! build time (CUDA_PATH or /usr/local/cuda).

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "cuda")]
    {
        println!("cargo:warning=cuda feature enabled — ensure the CUDA toolkit is installed");
    }
}
