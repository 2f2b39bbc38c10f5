use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "widget-player", version)]
pub struct Args {
    /// Library root; sibling traversal never leaves it
    #[arg(long, required_unless_present = "list_devices")]
    pub library: Option<PathBuf>,

    /// Directory to load on startup (defaults to the library root)
    #[arg(long)]
    pub start_dir: Option<PathBuf>,

    /// Serve tracks from this media server instead of the local files, e.g. http://nas:8080/media
    #[arg(long)]
    pub remote_base: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// HTTP control API bind address
    #[arg(long, default_value = "127.0.0.1:5580")]
    pub http_bind: SocketAddr,

    /// Settings file (TOML). Defaults to widget-settings.toml next to the executable
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Keep settings in memory only
    #[arg(long)]
    pub no_persist: bool,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Queue buffer target in seconds (per stage)
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Timeout for remote range reads and existence probes, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub http_timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_tuning_flags() {
        let args = Args::try_parse_from(["widget-player", "--library", "/music"]).unwrap();
        assert_eq!(args.library, Some(PathBuf::from("/music")));
        assert_eq!(args.http_bind.port(), 5580);
        assert_eq!(args.chunk_frames, 1024);
        assert_eq!(args.refill_max_frames, 4096);
        assert!(!args.no_persist);
        assert!(args.remote_base.is_none());
    }

    #[test]
    fn library_is_required_unless_listing_devices() {
        assert!(Args::try_parse_from(["widget-player"]).is_err());
        let args = Args::try_parse_from(["widget-player", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.library.is_none());
    }
}
