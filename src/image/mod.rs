// VM image artifact handling: digest-keyed on-disk cache and async download.

pub mod digest;
pub mod downloader;

pub use digest::{compute_digest, DIGEST_HEX_LEN, DIGEST_PREFIX};
pub use downloader::{
    DownloadProgress, DownloadState, ImageDownloader, ImageError, DISK_FILE, KERNEL_FILE,
};
