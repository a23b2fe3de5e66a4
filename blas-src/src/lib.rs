//! Selects the LAPACK backend linked under `ndarray-linalg`: Accelerate on macOS,
//! statically linked sequential MKL everywhere else. Downstream crates only need
//! `extern crate blas_src;` to pull the backend into the final link.

#[cfg(target_os = "macos")]
extern crate accelerate_src;

#[cfg(not(target_os = "macos"))]
extern crate intel_mkl_src;
