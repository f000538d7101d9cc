/// A name that matches a `LIST` command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Name {
    pub(crate) name: String,
    pub(crate) delimiter: Option<String>,
    pub(crate) selectable: bool,
}

impl Name {
    /// The hierarchy delimiter is a character used to delimit levels of hierarchy in a mailbox
    /// name. `None` means that no hierarchy exists; the name is a "flat" name.
    pub fn delimiter(&self) -> Option<&str> {
        self.delimiter.as_deref()
    }

    /// The mailbox name, valid as an argument for `SELECT` unless the name is not
    /// [`selectable`](Name::selectable).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` when the server marked the name `\Noselect`, i.e. it is only a node in the folder
    /// hierarchy.
    pub fn selectable(&self) -> bool {
        self.selectable
    }
}
