
use crate::error::{Error, Result};
use crate::event::{verify_field, Event};

/// Comparison operators of the kernel filter grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compare {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Glob match, `~`. String fields only.
    Regex,
    /// Bitwise test, `&`.
    BitAnd,
}

impl Compare {
    fn as_str(self) -> &'static str {
        match self {
            Compare::Eq => "==",
            Compare::Ne => "!=",
            Compare::Gt => ">",
            Compare::Ge => ">=",
            Compare::Lt => "<",
            Compare::Le => "<=",
            Compare::Regex => "~",
            Compare::BitAnd => "&",
        }
    }
}

/// One token of a filter expression.
///
/// A filter is built token by token; the builder tracks enough grammar
/// state to reject sequences the kernel would refuse, like an operator
/// with no left-hand operand or a stray closing parenthesis.
#[derive(Clone, Copy, Debug)]
pub enum Item<'a> {
    /// `field OP val`. The field must exist on the event the filter is
    /// bound to. String fields admit only [`Compare::Eq`],
    /// [`Compare::Ne`] and [`Compare::Regex`], and their value is
    /// emitted double-quoted.
    Compare {
        field: &'a str,
        op: Compare,
        val: &'a str,
    },
    And,
    Or,
    Not,
    OpenParen,
    CloseParen,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum State {
    #[default]
    Empty,
    /// An operator or open parenthesis wants an operand.
    NeedOperand,
    /// The expression ends in a complete operand.
    HaveOperand,
}

// Filter buffer plus the grammar state carried across appends.
#[derive(Clone, Debug, Default)]
pub(crate) struct Filter {
    buf: String,
    state: State,
    parens: u32,
}

impl Filter {
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.buf
    }

    /// Parentheses still open. Serializers that close them append this
    /// many `)` after the expression.
    pub(crate) fn parens(&self) -> u32 {
        self.parens
    }

    /// A filter is installable unless it ends in a dangling operator.
    /// Open parentheses are fine, the serializer closes them.
    pub(crate) fn well_formed(&self) -> bool {
        self.state != State::NeedOperand
    }

    pub(crate) fn append(&mut self, event: &Event, item: Item<'_>) -> Result<()> {
        match item {
            Item::Compare { field, op, val } => {
                if self.state == State::HaveOperand {
                    return Err(Error::InvalidArgument(
                        "comparison must follow an operator or open parenthesis",
                    ));
                }
                let string = verify_field(event, field)?.array;
                if string && !matches!(op, Compare::Eq | Compare::Ne | Compare::Regex) {
                    return Err(Error::InvalidArgument(
                        "string fields only support ==, != and ~",
                    ));
                }
                let val = if string && !val.starts_with('"') {
                    format!("\"{val}\"")
                } else {
                    val.to_string()
                };
                self.push_token(&format!("{field} {} {val}", op.as_str()));
                self.state = State::HaveOperand;
            }
            Item::And | Item::Or => {
                if self.state != State::HaveOperand {
                    return Err(Error::InvalidArgument("operator needs a left-hand operand"));
                }
                self.push_token(if matches!(item, Item::And) { "&&" } else { "||" });
                self.state = State::NeedOperand;
            }
            Item::Not => {
                if self.state == State::HaveOperand {
                    return Err(Error::InvalidArgument("! cannot follow an operand"));
                }
                self.push_token("!");
                self.state = State::NeedOperand;
            }
            Item::OpenParen => {
                if self.state == State::HaveOperand {
                    return Err(Error::InvalidArgument("( cannot follow an operand"));
                }
                self.push_token("(");
                self.parens += 1;
                self.state = State::NeedOperand;
            }
            Item::CloseParen => {
                if self.state != State::HaveOperand {
                    return Err(Error::InvalidArgument(") needs a complete operand"));
                }
                if self.parens == 0 {
                    return Err(Error::InvalidArgument("no parenthesis left to close"));
                }
                self.buf.push(')');
                self.parens -= 1;
            }
        }
        Ok(())
    }

    // Tokens are space-separated, except right after `(` and `!`.
    fn push_token(&mut self, token: &str) {
        if !self.buf.is_empty() && !self.buf.ends_with(['(', '!']) {
            self.buf.push(' ');
        }
        self.buf.push_str(token);
    }
}
