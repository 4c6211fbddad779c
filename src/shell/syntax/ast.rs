use std::ffi::OsStr;

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Argument<'a> {
    Literal(&'a OsStr),
    /// `> path`: standard output to `path`, created or truncated.
    Redirect(&'a OsStr),
    /// `< path`: standard input from `path`.
    Input(&'a OsStr),
}

/// A classified command line. `binary` is the first literal; `arguments`
/// holds every other argument, redirections included, in input order.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Command<'a> {
    pub binary: &'a OsStr,
    pub arguments: Vec<Argument<'a>>,
}

#[cfg(test)]
impl<'a> Command<'a> {
    /// The plain arguments, without the redirections.
    pub fn literals(&self) -> impl Iterator<Item = &'a OsStr> + '_ {
        self.arguments.iter().filter_map(|arg| match *arg {
            Argument::Literal(s) => Some(s),
            _ => None,
        })
    }

    pub fn redirections(&self) -> impl Iterator<Item = &Argument<'a>> + '_ {
        self.arguments
            .iter()
            .filter(|arg| !matches!(arg, Argument::Literal(_)))
    }
}
