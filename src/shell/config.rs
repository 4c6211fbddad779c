use argh::FromArgs;

/// Longest input line accepted by default, in bytes.
pub const DEFAULT_MAX_LINE: usize = 1024;

#[derive(FromArgs, Debug, Clone, PartialEq)]
/// A minimal interactive command shell.
pub struct Config {
    /// prompt printed before each input line is read
    #[argh(option, default = "String::from(\"$ \")")]
    pub prompt: String,

    /// print the prompt even when standard input is not a terminal
    #[argh(switch, short = 'i')]
    pub interactive: bool,

    /// longest accepted input line, in bytes
    #[argh(option, default = "DEFAULT_MAX_LINE")]
    pub max_line: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            prompt: String::from("$ "),
            interactive: false,
            max_line: DEFAULT_MAX_LINE,
        }
    }
}
