use clap::Args;

#[derive(Args)]
pub struct CompleteCommand {
    /// Prompt text
    pub prompt: String,

    /// Backend option as KEY=VALUE, e.g. --opt=--temp=0.7 (repeatable)
    #[arg(long = "opt", value_name = "KEY=VALUE", allow_hyphen_values = true)]
    pub options: Vec<String>,

    /// Backend flag without a value, e.g. --flag=--ignore-eos (repeatable)
    #[arg(long = "flag", value_name = "KEY", allow_hyphen_values = true)]
    pub flags: Vec<String>,
}
