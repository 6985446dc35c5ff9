use clap::Args;

#[derive(Args)]
pub struct StatusCommand {
    /// Keep the backend running until Ctrl-C instead of stopping it after the check
    #[arg(long)]
    pub keep_running: bool,
}
