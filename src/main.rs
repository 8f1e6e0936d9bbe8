use burn::optim::AdamConfig;
use lung_seg::training::TrainingConfig;
use lung_seg::unet_model::UNetConfig;

pub const ARTIFACT_DIR: &str = "artifacts/lung-seg";
pub const IMAGE_DIR: &str = "Data/Lung Segmentation/CXR_png";
pub const MASK_DIR: &str = "Data/Lung Segmentation/masks";

pub fn config() -> TrainingConfig {
    TrainingConfig::new(UNetConfig::new(), AdamConfig::new())
}

#[cfg(feature = "ndarray")]
mod ndarray {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};
    use lung_seg::training;

    pub fn run() {
        training::train::<Autodiff<NdArray>>(
            super::ARTIFACT_DIR,
            super::IMAGE_DIR,
            super::MASK_DIR,
            super::config(),
            NdArrayDevice::Cpu,
        );
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use burn::backend::libtorch::LibTorchDevice;
    use burn::backend::{Autodiff, LibTorch};
    use lung_seg::training;

    pub fn run() {
        training::train::<Autodiff<LibTorch>>(
            super::ARTIFACT_DIR,
            super::IMAGE_DIR,
            super::MASK_DIR,
            super::config(),
            LibTorchDevice::Cpu,
        );
    }
}

#[cfg(feature = "tch-gpu")]
mod tch_gpu {
    use burn::backend::libtorch::LibTorchDevice;
    use burn::backend::{Autodiff, LibTorch};
    use lung_seg::training;

    pub fn run() {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        training::train::<Autodiff<LibTorch>>(
            super::ARTIFACT_DIR,
            super::IMAGE_DIR,
            super::MASK_DIR,
            super::config(),
            device,
        );
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use burn::backend::wgpu::WgpuDevice;
    use burn::backend::{Autodiff, Wgpu};
    use lung_seg::training;

    pub fn run() {
        training::train::<Autodiff<Wgpu>>(
            super::ARTIFACT_DIR,
            super::IMAGE_DIR,
            super::MASK_DIR,
            super::config(),
            WgpuDevice::default(),
        );
    }
}

#[cfg(feature = "cuda")]
mod cuda {
    use burn::backend::cuda::CudaDevice;
    use burn::backend::{Autodiff, Cuda};
    use lung_seg::training;

    pub fn run() {
        training::train::<Autodiff<Cuda>>(
            super::ARTIFACT_DIR,
            super::IMAGE_DIR,
            super::MASK_DIR,
            super::config(),
            CudaDevice::default(),
        );
    }
}

fn main() {
    #[cfg(feature = "ndarray")]
    ndarray::run();
    #[cfg(feature = "tch-cpu")]
    tch_cpu::run();
    #[cfg(feature = "tch-gpu")]
    tch_gpu::run();
    #[cfg(feature = "wgpu")]
    wgpu::run();
    #[cfg(feature = "cuda")]
    cuda::run();
}
