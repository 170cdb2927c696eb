//! Operator spellings, precedence, and the lexer's matching trie.
//!
//! The precedence table is the single source of truth: the lexer builds its
//! trie from the table's keys (plus punctuation), the parser climbs by the
//! table's precedences, and the printer parenthesizes by comparing them.
//! Both the table and the trie are immutable after first use.

use std::sync::LazyLock;

use ahash::AHashMap;

use crate::token::TokenKind;

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BinOpKind {
    Add,
    Sub,
    Mult,
    MatMult,
    Div,
    Mod,
    Pow,
    LShift,
    RShift,
    BitOr,
    BitXor,
    BitAnd,
    FloorDiv,
}

impl BinOpKind {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mult => "*",
            Self::MatMult => "@",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::LShift => "<<",
            Self::RShift => ">>",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::BitAnd => "&",
            Self::FloorDiv => "//",
        }
    }
}

/// Short-circuiting boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BoolOpKind {
    And,
    Or,
}

impl BoolOpKind {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UnaryOpKind {
    Not,
    USub,
    UAdd,
    Invert,
}

impl UnaryOpKind {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Not => "not ",
            Self::USub => "-",
            Self::UAdd => "+",
            Self::Invert => "~",
        }
    }
}

/// Comparison operators. These always produce a bool and may chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CmpOpKind {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOpKind {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtE => "<=",
            Self::Gt => ">",
            Self::GtE => ">=",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// Precedence of prefix `-`, `+`, `~`. `not` uses its own table entry.
pub const UNARY_PRECEDENCE: i8 = 13;

/// One row of the precedence table.
///
/// An operator can act in more than one class (`-` is binary and unary,
/// `+=` is only an augmented target), so the classification fields are all
/// optional, never all empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpConfig {
    pub precedence: i8,
    pub left_associative: bool,
    pub binary: Option<BinOpKind>,
    pub unary: Option<UnaryOpKind>,
    pub boolean: Option<BoolOpKind>,
    pub cmp: Option<CmpOpKind>,
    /// Set for `op=` spellings; the statement parser folds these into
    /// augmented assignments.
    pub aug: Option<BinOpKind>,
}

impl OpConfig {
    fn binary(precedence: i8, op: BinOpKind) -> Self {
        Self {
            precedence,
            left_associative: true,
            binary: Some(op),
            ..Self::default()
        }
    }

    fn boolean(precedence: i8, op: BoolOpKind) -> Self {
        Self {
            precedence,
            left_associative: true,
            boolean: Some(op),
            ..Self::default()
        }
    }

    fn cmp(op: CmpOpKind) -> Self {
        Self {
            precedence: 6,
            left_associative: true,
            cmp: Some(op),
            ..Self::default()
        }
    }

    fn aug(op: BinOpKind) -> Self {
        Self {
            precedence: -1,
            left_associative: true,
            aug: Some(op),
            ..Self::default()
        }
    }
}

/// The default precedence table, keyed by operator spelling.
pub fn precedence_table() -> &'static AHashMap<&'static str, OpConfig> {
    static TABLE: LazyLock<AHashMap<&'static str, OpConfig>> = LazyLock::new(|| {
        let mut t = AHashMap::new();
        t.insert("or", OpConfig::boolean(3, BoolOpKind::Or));
        t.insert("and", OpConfig::boolean(4, BoolOpKind::And));
        t.insert(
            "not",
            OpConfig {
                precedence: 5,
                unary: Some(UnaryOpKind::Not),
                ..OpConfig::default()
            },
        );

        t.insert("==", OpConfig::cmp(CmpOpKind::Eq));
        t.insert("!=", OpConfig::cmp(CmpOpKind::NotEq));
        t.insert("<", OpConfig::cmp(CmpOpKind::Lt));
        t.insert("<=", OpConfig::cmp(CmpOpKind::LtE));
        t.insert(">", OpConfig::cmp(CmpOpKind::Gt));
        t.insert(">=", OpConfig::cmp(CmpOpKind::GtE));
        t.insert("is", OpConfig::cmp(CmpOpKind::Is));
        t.insert("is not", OpConfig::cmp(CmpOpKind::IsNot));
        t.insert("in", OpConfig::cmp(CmpOpKind::In));
        t.insert("not in", OpConfig::cmp(CmpOpKind::NotIn));

        t.insert("|", OpConfig::binary(7, BinOpKind::BitOr));
        t.insert("^", OpConfig::binary(8, BinOpKind::BitXor));
        t.insert("&", OpConfig::binary(9, BinOpKind::BitAnd));
        t.insert("<<", OpConfig::binary(10, BinOpKind::LShift));
        t.insert(">>", OpConfig::binary(10, BinOpKind::RShift));

        t.insert(
            "+",
            OpConfig {
                unary: Some(UnaryOpKind::UAdd),
                ..OpConfig::binary(11, BinOpKind::Add)
            },
        );
        t.insert(
            "-",
            OpConfig {
                unary: Some(UnaryOpKind::USub),
                ..OpConfig::binary(11, BinOpKind::Sub)
            },
        );

        t.insert("*", OpConfig::binary(12, BinOpKind::Mult));
        t.insert("@", OpConfig::binary(12, BinOpKind::MatMult));
        t.insert("/", OpConfig::binary(12, BinOpKind::Div));
        t.insert("//", OpConfig::binary(12, BinOpKind::FloorDiv));
        t.insert("%", OpConfig::binary(12, BinOpKind::Mod));

        t.insert(
            "~",
            OpConfig {
                precedence: UNARY_PRECEDENCE,
                unary: Some(UnaryOpKind::Invert),
                ..OpConfig::default()
            },
        );

        // `**` binds tighter than unary minus and associates to the right.
        t.insert(
            "**",
            OpConfig {
                precedence: 14,
                left_associative: false,
                binary: Some(BinOpKind::Pow),
                ..OpConfig::default()
            },
        );

        t.insert("+=", OpConfig::aug(BinOpKind::Add));
        t.insert("-=", OpConfig::aug(BinOpKind::Sub));
        t.insert("*=", OpConfig::aug(BinOpKind::Mult));
        t.insert("@=", OpConfig::aug(BinOpKind::MatMult));
        t.insert("/=", OpConfig::aug(BinOpKind::Div));
        t.insert("//=", OpConfig::aug(BinOpKind::FloorDiv));
        t.insert("%=", OpConfig::aug(BinOpKind::Mod));
        t.insert("**=", OpConfig::aug(BinOpKind::Pow));
        t.insert("<<=", OpConfig::aug(BinOpKind::LShift));
        t.insert(">>=", OpConfig::aug(BinOpKind::RShift));
        t.insert("|=", OpConfig::aug(BinOpKind::BitOr));
        t.insert("^=", OpConfig::aug(BinOpKind::BitXor));
        t.insert("&=", OpConfig::aug(BinOpKind::BitAnd));
        t
    });
    &TABLE
}

/// Punctuation the lexer matches through the same trie but surfaces as
/// dedicated token kinds.
const PUNCTUATION: &[(&str, TokenKind)] = &[
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("[", TokenKind::LBracket),
    ("]", TokenKind::RBracket),
    ("{", TokenKind::LBrace),
    ("}", TokenKind::RBrace),
    (",", TokenKind::Comma),
    (":", TokenKind::Colon),
    (";", TokenKind::Semicolon),
    (".", TokenKind::Dot),
    ("->", TokenKind::Arrow),
    ("=", TokenKind::Assign),
    (":=", TokenKind::Walrus),
];

/// Maps a matched spelling to a dedicated token kind, when it has one.
pub fn punctuation_kind(spelling: &str) -> Option<TokenKind> {
    PUNCTUATION.iter().find(|(s, _)| *s == spelling).map(|&(_, k)| k)
}

#[derive(Debug, Default)]
struct TrieNode {
    children: AHashMap<u8, TrieNode>,
    terminal: bool,
}

/// Greedy longest-match trie over operator and punctuation spellings.
#[derive(Debug, Default)]
pub struct OpTrie {
    root: TrieNode,
}

impl OpTrie {
    fn insert(&mut self, spelling: &str) {
        let mut node = &mut self.root;
        for &b in spelling.as_bytes() {
            node = node.children.entry(b).or_default();
        }
        node.terminal = true;
    }

    /// Whether any spelling starts with this byte.
    pub fn starts(&self, byte: u8) -> bool {
        self.root.children.contains_key(&byte)
    }

    /// Length of the longest spelling that prefixes `input`, if any.
    pub fn longest_match(&self, input: &[u8]) -> Option<usize> {
        let mut node = &self.root;
        let mut best = None;
        for (i, b) in input.iter().enumerate() {
            match node.children.get(b) {
                Some(child) => {
                    node = child;
                    if node.terminal {
                        best = Some(i + 1);
                    }
                }
                None => break,
            }
        }
        best
    }
}

/// The shared operator trie, built once from the precedence table and the
/// punctuation list. Word operators are matched by the keyword table, not
/// here.
pub fn op_trie() -> &'static OpTrie {
    static TRIE: LazyLock<OpTrie> = LazyLock::new(|| {
        let mut trie = OpTrie::default();
        for spelling in precedence_table().keys() {
            if spelling.bytes().all(|b| !b.is_ascii_alphabetic() && b != b' ') {
                trie.insert(spelling);
            }
        }
        for (spelling, _) in PUNCTUATION {
            trie.insert(spelling);
        }
        trie
    });
    &TRIE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_match_is_greedy() {
        let trie = op_trie();
        assert_eq!(trie.longest_match(b"**= x"), Some(3));
        assert_eq!(trie.longest_match(b"**2"), Some(2));
        assert_eq!(trie.longest_match(b"*2"), Some(1));
        assert_eq!(trie.longest_match(b"!x"), None);
        assert_eq!(trie.longest_match(b"!="), Some(2));
    }

    #[test]
    fn precedence_orders_match_grouping_expectations() {
        let table = precedence_table();
        assert!(table["+"].precedence < table["*"].precedence);
        assert!(table["*"].precedence < table["**"].precedence);
        assert!(table["or"].precedence < table["and"].precedence);
        assert!(!table["**"].left_associative);
    }
}
