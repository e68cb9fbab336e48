//! Regular expressions over sequences of user-defined elements.
//!
//! Ordinary regex engines match byte strings.  This crate matches
//! slices of an arbitrary element type `E`: a client registers named
//! **classes** (predicates `E -> bool`) and named **identities**
//! (concrete values matched by equality) with a [`Compiler`], then
//! compiles textual patterns that refer to those atoms by name.  The
//! compiled [`Regex`] is immutable and can run over `&[E]` from any
//! number of threads at once, reporting the overall span and numbered
//! or named capture groups.
//!
//! The NFA construction and simulation follow Russ Cox's article
//! <https://swtch.com/~rsc/regexp/regexp1.html> (Thompson construction
//! driven by a postfix token stream, Pike-style simulation with two
//! thread lists), extended with per-thread capture registers.
//!
//! # Architecture
//!
//! The pipeline is:
//!
//! ```text
//! pattern &str ──scan──> postfix tokens ──token2nfa──> NFA states ──> Regex
//!                 │
//!                 └── "[ ... ]" bodies ──dc_tokenize──> opcodes (DynProgram)
//! ```
//!
//! ## Pattern syntax
//!
//! | Construct      | Meaning                                       |
//! |----------------|-----------------------------------------------|
//! | `[:name:]`     | atom (class or identity) by name              |
//! | `[!:name:]`    | negated atom                                  |
//! | `[ expr ]`     | dynamic class: `!`, `&&`, `||` over atoms     |
//! | `.`            | any single element                            |
//! | `^`, `$`       | anchors at match start / input end            |
//! | `*`, `+`, `?`  | quantifiers on the preceding atom or group    |
//! | `\|`           | alternation                                   |
//! | `( ... )`      | numbered capture group                        |
//! | `(?P<name> ...)` | numbered and named capture group            |
//!
//! Whitespace between tokens is ignored.  Group numbers are assigned
//! to `(` in textual order starting at 1, so outer groups number
//! before their children.
//!
//! ## Capture registers
//!
//! Every simulator thread owns one [`Span`] per group.  The scanner
//! emits an `EndGroup` marker when a `)` closes; the builder records
//! the group number in the `starts` mark of the fragment's entry state
//! and keeps the matching `ends` mark *pending on the fragment* until
//! the dangling out-pointers are patched to a successor, which is
//! where the mark finally lands.  Keeping pending ends off the freshly
//! allocated `Split` of a `?` lets an optional group close on the path
//! that actually entered it, while `*`/`+` deliberately park the ends
//! on the loop split where the participation guard (`end` fires only
//! when `start` was set) keeps skipped iterations silent.
//!
//! On top of that, match completion collapses half-set and zero-length
//! registers to [`Span::NONE`], so an optional group that never took
//! part reports "absent" rather than an empty span.
//!
//! ## Dynamic classes
//!
//! A bracket body with more than two colons is a boolean expression
//! over atoms.  It compiles in two phases: a shunting-yard pass emits
//! postfix tokens where each `&&`/`||` allocates a short-circuit jump
//! target (`JumpIfFalse`/`JumpIfTrue` after the left operand, a
//! pending `AssertTrue` carrying the same target after the right), and
//! a lowering pass resolves targets to opcode indices.  Evaluation is
//! a small value stack; jumps peek at the top and leave it in place so
//! the `AssertTrue` landing pad reads the same value.  Predicates on
//! the dead side of a short-circuit are never invoked.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::ops::{Index, IndexMut};
use std::path::Path;
use std::str::CharIndices;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, trace};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A compile-time pattern error.
///
/// Every variant that points at the pattern carries `pos`, the byte
/// offset of the offending character.  Matching itself never fails;
/// an input that does not match produces an unsuccessful [`Match`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A character that cannot start a pattern token.
    Syntax { pos: usize, ch: char },
    /// The pattern ended inside an open construct.
    UnexpectedEnd,
    /// A `)` with no matching `(`.
    UnmatchedClose { pos: usize },
    /// A `)` closing a group that contains no atoms.
    EmptyGroup { pos: usize },
    /// `*`, `+` or `?` with no preceding atom or group.
    DanglingQuantifier { pos: usize, glob: char },
    /// A `|` with no left-hand operand, or a trailing `|`.
    StrayAlternate { pos: usize },
    /// A class form did not start with `:` after `[` or `[!`.
    ExpectedColon { pos: usize },
    /// A class form did not end with `]` after the closing `:`.
    ExpectedBracket { pos: usize },
    /// A class or group name contains a control character.
    NonGraphicName { pos: usize },
    /// `(?` was not followed by `P<`.
    GroupHeader { pos: usize },
    /// `(?P<>` — a named group with an empty name.
    EmptyGroupName { pos: usize },
    /// The same `(?P<name>` was used for two groups.
    DuplicateGroupName { pos: usize, name: String },
    /// An atom name that is not registered with the compiler.
    UnknownName { pos: usize, name: String },
    /// A character that cannot appear in a dynamic-class expression.
    DynSyntax { pos: usize, ch: char },
    /// A single `&` or `|` inside a dynamic class.
    HalfOperator { pos: usize, ch: char },
    /// `&&`/`||` where an atom was expected, or vice versa.
    MisplacedOperator { pos: usize },
    /// An atom reference where an operator was expected.
    MisplacedName { pos: usize },
    /// A dynamic-class expression ending after `!`, `&&` or `||`.
    TrailingOperator { pos: usize },
    /// An unclosed `(` inside a dynamic class.
    UnbalancedParen { pos: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { pos, ch } => {
                write!(f, "syntax error at position {} starting with {:?}", pos, ch)
            }
            Self::UnexpectedEnd => write!(f, "unexpected end of pattern"),
            Self::UnmatchedClose { pos } => {
                write!(f, "close paren at position {} has no opening paren", pos)
            }
            Self::EmptyGroup { pos } => {
                write!(f, "group closed at position {} contains nothing to match", pos)
            }
            Self::DanglingQuantifier { pos, glob } => {
                write!(f, "quantifier {:?} at position {} has no preceding item", glob, pos)
            }
            Self::StrayAlternate { pos } => {
                write!(f, "'|' at position {} has no operand", pos)
            }
            Self::ExpectedColon { pos } => {
                write!(f, "expected ':' to start a class name at position {}", pos)
            }
            Self::ExpectedBracket { pos } => {
                write!(f, "expected ']' to end a class at position {}", pos)
            }
            Self::NonGraphicName { pos } => {
                write!(f, "the name starting at position {} contains a non-graphic character", pos)
            }
            Self::GroupHeader { pos } => {
                write!(f, "expected 'P<' after '(?' at position {}", pos)
            }
            Self::EmptyGroupName { pos } => {
                write!(f, "empty group name at position {}", pos)
            }
            Self::DuplicateGroupName { pos, name } => {
                write!(f, "group name {:?} at position {} is already in use", name, pos)
            }
            Self::UnknownName { pos, name } => {
                write!(f, "no class or identity named {:?} at position {}", name, pos)
            }
            Self::DynSyntax { pos, ch } => {
                write!(f, "syntax error in class expression at position {} starting with {:?}", pos, ch)
            }
            Self::HalfOperator { pos, ch } => {
                write!(f, "expected two {:?}'s at position {}", ch, pos)
            }
            Self::MisplacedOperator { pos } => {
                write!(f, "operator at position {} is not allowed here", pos)
            }
            Self::MisplacedName { pos } => {
                write!(f, "atom reference at position {} is not allowed here", pos)
            }
            Self::TrailingOperator { pos } => {
                write!(f, "class expression at position {} ends with an operator", pos)
            }
            Self::UnbalancedParen { pos } => {
                write!(f, "unbalanced left paren starting at position {}", pos)
            }
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

/// A half-open, 0-indexed range over the input slice.
///
/// A slice of one element at the beginning of the input has
/// `start = 0` and `end = 1`.  [`Span::NONE`] (`{-1, -1}`) means the
/// span does not exist — an unmatched capture group reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: isize,
    pub end: isize,
}

impl Span {
    /// The absent span, reported for capture groups that did not
    /// participate in a match.
    pub const NONE: Self = Self { start: -1, end: -1 };

    /// Returns `true` for [`Span::NONE`].
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Number of elements covered.  Zero for [`Span::NONE`].
    pub fn len(&self) -> usize {
        if self.is_none() {
            0
        } else {
            (self.end - self.start).max(0) as usize
        }
    }

    /// Returns `true` when the span covers no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Atoms and the compiler
// ---------------------------------------------------------------------------

/// A class predicate.  Shared (`Arc`) so a compiled [`Regex`] can own
/// the predicates it uses without borrowing from the [`Compiler`].
pub type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// A registered atom: either a named class or a named identity.
enum Atom<E> {
    Class(Predicate<E>),
    Identity(E),
}

/// Registers atoms and compiles patterns that refer to them.
///
/// The compiler has two phases.  While open, [`add_class`] and
/// [`add_identity`] register atoms; after [`finalize`], only
/// [`compile`] / [`must_compile`] are allowed.  Calling an operation
/// in the wrong phase, or registering a duplicate name, is a
/// programmer error and panics.
///
/// Compiled regexes do not borrow the compiler: they intern copies of
/// the atoms they use, so they stay valid after the compiler is gone.
///
/// [`add_class`]: Compiler::add_class
/// [`add_identity`]: Compiler::add_identity
/// [`finalize`]: Compiler::finalize
/// [`compile`]: Compiler::compile
/// [`must_compile`]: Compiler::must_compile
pub struct Compiler<E> {
    finalized: bool,
    /// One namespace covers both atom kinds; insertion order makes
    /// iteration and diagnostics deterministic.
    atoms: IndexMap<String, Atom<E>>,
}

impl<E> Default for Compiler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Compiler<E> {
    pub fn new() -> Self {
        Self {
            finalized: false,
            atoms: IndexMap::new(),
        }
    }

    fn assert_open(&self) {
        if self.finalized {
            panic!("seqre::Compiler is already finalized");
        }
    }

    fn assert_finalized(&self) {
        if !self.finalized {
            panic!("seqre::Compiler isn't finalized yet");
        }
    }

    fn assert_fresh_name(&self, name: &str) {
        match self.atoms.get(name) {
            Some(Atom::Class(_)) => panic!("a class named {:?} already exists", name),
            Some(Atom::Identity(_)) => panic!("an identity named {:?} already exists", name),
            None => {}
        }
    }

    /// Register a named class.  The predicate decides membership for
    /// one element at a time and must not observe shared mutable
    /// state: a compiled regex may call it from multiple threads.
    ///
    /// # Panics
    ///
    /// If the compiler is finalized or the name is already taken.
    pub fn add_class<F>(&mut self, name: &str, predicate: F)
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.assert_open();
        self.assert_fresh_name(name);
        self.atoms
            .insert(name.to_owned(), Atom::Class(Arc::new(predicate)));
    }

    /// Register a named identity: a concrete element value matched by
    /// equality.
    ///
    /// # Panics
    ///
    /// If the compiler is finalized or the name is already taken.
    pub fn add_identity(&mut self, name: &str, value: E) {
        self.assert_open();
        self.assert_fresh_name(name);
        self.atoms.insert(name.to_owned(), Atom::Identity(value));
    }

    /// Close the registration phase.  Required before compiling.
    ///
    /// # Panics
    ///
    /// If called twice.
    pub fn finalize(&mut self) {
        self.assert_open();
        self.finalized = true;
    }

    fn lookup(&self, name: &str) -> Option<&Atom<E>> {
        self.atoms.get(name)
    }
}

impl<E: Clone + PartialEq> Compiler<E> {
    /// Compile a pattern into a reusable, thread-safe [`Regex`].
    ///
    /// # Panics
    ///
    /// If the compiler is not finalized.
    pub fn compile(&self, pattern: &str) -> Result<Regex<E>, Error> {
        self.assert_finalized();
        let tokens = Scanner::new(pattern).scan()?;
        NfaBuilder::new(self).build(&tokens)
    }

    /// Like [`compile`](Compiler::compile), but panics on a malformed
    /// pattern.  Intended for patterns that are fixed at build time.
    pub fn must_compile(&self, pattern: &str) -> Regex<E> {
        match self.compile(pattern) {
            Ok(re) => re,
            Err(err) => panic!("seqre: compiling {:?}: {}", pattern, err),
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern cursor
// ---------------------------------------------------------------------------

/// A cursor over the pattern string yielding one `char` at a time
/// together with its byte offset.  Byte offsets are what compile
/// errors report.
#[derive(Clone)]
struct RuneCursor<'a> {
    text: &'a str,
    iter: CharIndices<'a>,
}

impl<'a> RuneCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            iter: text.char_indices(),
        }
    }

    /// Byte offset of the next unread character (the pattern length
    /// at end of input).
    fn pos(&self) -> usize {
        self.text.len() - self.iter.as_str().len()
    }

    /// Consume and return the next character, or `None` at the end.
    fn bump(&mut self) -> Option<(usize, char)> {
        self.iter.next()
    }

    /// Look at the next character without consuming it.
    fn peek(&self) -> Option<char> {
        self.iter.as_str().chars().next()
    }

    /// The pattern text between two byte offsets.
    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[start..end]
    }
}

/// Whether a character may appear in a class or group name.  Names
/// may contain anything printable, spaces included; control
/// characters are rejected.
fn is_graphic(ch: char) -> bool {
    !ch.is_control()
}

// ---------------------------------------------------------------------------
// Pattern scanner (surface syntax -> postfix tokens)
// ---------------------------------------------------------------------------

/// A token of the postfix stream the scanner produces.  Operands
/// precede operators; `EndGroup` marks the fragment on the top of the
/// builder's stack as a finished capture group.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    /// `[:name:]` or `[!:name:]` — class or identity by name.
    Class {
        name: String,
        pos: usize,
        negated: bool,
    },
    /// `[ expr ]` — dynamic class; the body text compiles separately.
    DynClass { expr: String, pos: usize },
    Concat,
    Alternate,
    Star,
    Plus,
    Question,
    /// `.`
    Any,
    /// `^`
    AssertBegin,
    /// `$`
    AssertEnd,
    /// Emitted at `)`: the top fragment is capture group `num`.
    EndGroup { num: u32, name: Option<String> },
}

/// Saved counters for one open `(`, restored at the matching `)`.
struct Frame {
    natom: usize,
    nalt: usize,
    group_num: u32,
    group_name: Option<String>,
}

/// The classical two-counter shunting-yard over implicit-concat
/// regexes: `natom` counts operands awaiting concatenation, `nalt`
/// counts alternations awaiting emission, and a frame stack saves
/// both across parenthesised groups.
struct Scanner<'a> {
    cursor: RuneCursor<'a>,
    tokens: Vec<Token>,
    natom: usize,
    nalt: usize,
    frames: Vec<Frame>,
    /// Pre-order `(` counter; the source of group numbers.
    groups_allocated: u32,
    /// Group names seen so far, for duplicate detection.
    group_names: Vec<String>,
}

impl<'a> Scanner<'a> {
    fn new(pattern: &'a str) -> Self {
        Self {
            cursor: RuneCursor::new(pattern),
            tokens: Vec::new(),
            natom: 0,
            nalt: 0,
            frames: Vec::new(),
            groups_allocated: 0,
            group_names: Vec::new(),
        }
    }

    fn scan(mut self) -> Result<Vec<Token>, Error> {
        while let Some((pos, ch)) = self.cursor.bump() {
            match ch {
                ' ' | '\t' | '\n' => continue,
                '(' => self.lparen()?,
                '|' => self.pipe(pos)?,
                ')' => self.rparen(pos)?,
                '*' => self.quantifier(Token::Star, ch, pos)?,
                '+' => self.quantifier(Token::Plus, ch, pos)?,
                '?' => self.quantifier(Token::Question, ch, pos)?,
                '[' => self.bracket()?,
                '.' => self.operand(Token::Any),
                '^' => self.operand(Token::AssertBegin),
                '$' => self.operand(Token::AssertEnd),
                _ => return Err(Error::Syntax { pos, ch }),
            }
        }

        // A frame still open at the end means an unclosed '('.
        if !self.frames.is_empty() {
            return Err(Error::UnexpectedEnd);
        }
        if self.nalt > 0 && self.natom == 0 {
            // "a |" — the alternation never got its right operand.
            return Err(Error::StrayAlternate {
                pos: self.cursor.pos(),
            });
        }
        self.flush_concats();
        for _ in 0..self.nalt {
            self.tokens.push(Token::Alternate);
        }

        trace!("scanned pattern into {} tokens: {:?}", self.tokens.len(), self.tokens);
        Ok(self.tokens)
    }

    /// Emit the `Concat` operators owed for the atoms seen so far.
    /// N pending atoms need N-1 concatenations.
    fn flush_concats(&mut self) {
        while self.natom > 1 {
            self.tokens.push(Token::Concat);
            self.natom -= 1;
        }
        self.natom = 0;
    }

    /// Emit an operand token, concatenating it with a pending atom
    /// first when there is one.
    fn operand(&mut self, token: Token) {
        if self.natom > 1 {
            self.natom -= 1;
            self.tokens.push(Token::Concat);
        }
        self.tokens.push(token);
        self.natom += 1;
    }

    fn lparen(&mut self) -> Result<(), Error> {
        // "(?P<name>" — a small three-state recogniser: 'P', '<',
        // then the name up to '>'.
        let group_name = if self.cursor.peek() == Some('?') {
            self.cursor.bump();
            Some(self.group_header()?)
        } else {
            None
        };

        self.groups_allocated += 1;

        if self.natom > 1 {
            self.natom -= 1;
            self.tokens.push(Token::Concat);
        }
        self.frames.push(Frame {
            natom: self.natom,
            nalt: self.nalt,
            group_num: self.groups_allocated,
            group_name,
        });
        self.natom = 0;
        self.nalt = 0;
        Ok(())
    }

    /// Parse the `P<name>` part of a named-group header; the `(?` has
    /// already been consumed.
    fn group_header(&mut self) -> Result<String, Error> {
        match self.cursor.bump() {
            Some((_, 'P')) => {}
            Some((pos, _)) => return Err(Error::GroupHeader { pos }),
            None => return Err(Error::UnexpectedEnd),
        }
        match self.cursor.bump() {
            Some((_, '<')) => {}
            Some((pos, _)) => return Err(Error::GroupHeader { pos }),
            None => return Err(Error::UnexpectedEnd),
        }
        let name_pos = self.cursor.pos();
        let mut name = String::new();
        loop {
            match self.cursor.bump() {
                Some((_, '>')) => break,
                Some((_, ch)) if is_graphic(ch) => name.push(ch),
                Some(_) => return Err(Error::NonGraphicName { pos: name_pos }),
                None => return Err(Error::UnexpectedEnd),
            }
        }
        if name.is_empty() {
            return Err(Error::EmptyGroupName { pos: name_pos });
        }
        if self.group_names.contains(&name) {
            return Err(Error::DuplicateGroupName {
                pos: name_pos,
                name,
            });
        }
        self.group_names.push(name.clone());
        Ok(name)
    }

    fn pipe(&mut self, pos: usize) -> Result<(), Error> {
        if self.natom == 0 {
            return Err(Error::StrayAlternate { pos });
        }
        self.flush_concats();
        self.nalt += 1;
        Ok(())
    }

    fn rparen(&mut self, pos: usize) -> Result<(), Error> {
        if self.frames.is_empty() {
            return Err(Error::UnmatchedClose { pos });
        }
        if self.natom == 0 {
            return Err(Error::EmptyGroup { pos });
        }
        self.flush_concats();
        for _ in 0..self.nalt {
            self.tokens.push(Token::Alternate);
        }
        let frame = self.frames.pop().unwrap();
        self.natom = frame.natom + 1;
        self.nalt = frame.nalt;
        self.tokens.push(Token::EndGroup {
            num: frame.group_num,
            name: frame.group_name,
        });
        Ok(())
    }

    fn quantifier(&mut self, token: Token, glob: char, pos: usize) -> Result<(), Error> {
        if self.natom == 0 {
            return Err(Error::DanglingQuantifier { pos, glob });
        }
        self.tokens.push(token);
        Ok(())
    }

    /// `[` — either a simple class `[:name:]` / `[!:name:]` or a
    /// dynamic-class expression.  A look-ahead counts colons up to the
    /// terminating `]` (a `]` inside an open `:name:` does not
    /// terminate); more than two colons means a dynamic class.
    fn bracket(&mut self) -> Result<(), Error> {
        let body_start = self.cursor.pos();
        let mut lookahead = self.cursor.clone();
        let mut colons = 0usize;
        let mut in_name = false;
        let body_end = loop {
            match lookahead.bump() {
                Some((_, ':')) => {
                    colons += 1;
                    in_name = !in_name;
                }
                Some((pos, ']')) if !in_name => break pos,
                Some(_) => {}
                None => return Err(Error::UnexpectedEnd),
            }
        };

        if colons > 2 {
            let expr = self.cursor.slice(body_start, body_end).to_owned();
            self.cursor = lookahead;
            self.operand(Token::DynClass {
                expr,
                pos: body_start,
            });
            return Ok(());
        }

        // Simple class: optional '!', then ':name:' and the closing ']'.
        let mut negated = false;
        if self.cursor.peek() == Some('!') {
            negated = true;
            self.cursor.bump();
        }
        match self.cursor.bump() {
            Some((_, ':')) => {}
            Some((pos, _)) => return Err(Error::ExpectedColon { pos }),
            None => return Err(Error::UnexpectedEnd),
        }
        let name_pos = self.cursor.pos();
        let mut name = String::new();
        loop {
            match self.cursor.bump() {
                Some((_, ':')) => break,
                Some((_, ch)) if is_graphic(ch) => name.push(ch),
                Some(_) => return Err(Error::NonGraphicName { pos: name_pos }),
                None => return Err(Error::UnexpectedEnd),
            }
        }
        match self.cursor.bump() {
            Some((_, ']')) => {}
            Some((pos, _)) => return Err(Error::ExpectedBracket { pos }),
            None => return Err(Error::UnexpectedEnd),
        }

        self.operand(Token::Class {
            name,
            pos: name_pos,
            negated,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dynamic classes (boolean expressions over atoms)
// ---------------------------------------------------------------------------

/// A postfix token of the dynamic-class sub-language.
///
/// `&&` and `||` compile to a short-circuit jump after their left
/// operand plus an `AssertTrue` landing pad after their right operand;
/// both carry the same `target` so the lowering pass can wire the jump
/// to the pad's opcode index.
#[derive(Clone, Debug, PartialEq, Eq)]
enum DcToken {
    Class { name: String, pos: usize },
    Not,
    JumpIfFalse { target: usize },
    JumpIfTrue { target: usize },
    AssertTrue { target: usize },
}

/// An operator held on the dynamic-class shunting-yard stack.
enum DcOp {
    LParen { pos: usize },
    Not,
    AssertTrue { target: usize, prec: u8 },
}

impl DcOp {
    fn prec(&self) -> u8 {
        match self {
            // Never popped by precedence; only a ')' removes it.
            DcOp::LParen { .. } => 0,
            DcOp::Not => DC_PREC_NOT,
            DcOp::AssertTrue { prec, .. } => *prec,
        }
    }
}

const DC_PREC_NOT: u8 = 1;
const DC_PREC_AND: u8 = 2;
const DC_PREC_OR: u8 = 3;

/// Shunting-yard tokeniser for dynamic-class expressions.
///
/// `base` is the byte offset of the expression inside the enclosing
/// pattern, so every reported position is pattern-absolute.
struct DcScanner<'a> {
    cursor: RuneCursor<'a>,
    base: usize,
    tokens: Vec<DcToken>,
    stack: Vec<DcOp>,
    next_target: usize,
}

impl<'a> DcScanner<'a> {
    fn new(expr: &'a str, base: usize) -> Self {
        Self {
            cursor: RuneCursor::new(expr),
            base,
            tokens: Vec::new(),
            stack: Vec::new(),
            next_target: 0,
        }
    }

    fn scan(mut self) -> Result<Vec<DcToken>, Error> {
        // The one-bit alternation automaton: atoms (and prefix
        // operators) are legal exactly when `allow_atom`, binary
        // operators exactly when `allow_binary`.
        let mut allow_atom = true;
        let mut allow_binary = false;

        while let Some((pos, ch)) = self.cursor.bump() {
            let abs = self.base + pos;
            match ch {
                ' ' | '\t' | '\n' => continue,

                '(' => {
                    if !allow_atom {
                        return Err(Error::MisplacedName { pos: abs });
                    }
                    self.stack.push(DcOp::LParen { pos: abs });
                }

                ')' => {
                    if !allow_binary {
                        return Err(Error::MisplacedOperator { pos: abs });
                    }
                    self.rparen(abs)?;
                    allow_atom = false;
                    allow_binary = true;
                }

                '|' => {
                    if !allow_binary {
                        return Err(Error::MisplacedOperator { pos: abs });
                    }
                    self.binary(abs, '|')?;
                    allow_atom = true;
                    allow_binary = false;
                }

                '&' => {
                    if !allow_binary {
                        return Err(Error::MisplacedOperator { pos: abs });
                    }
                    self.binary(abs, '&')?;
                    allow_atom = true;
                    allow_binary = false;
                }

                '!' => {
                    if !allow_atom {
                        return Err(Error::MisplacedOperator { pos: abs });
                    }
                    // No operator on the stack binds tighter than '!',
                    // so it pushes without popping anything.
                    self.stack.push(DcOp::Not);
                }

                ':' => {
                    if !allow_atom {
                        return Err(Error::MisplacedName { pos: abs });
                    }
                    self.atom()?;
                    allow_atom = false;
                    allow_binary = true;
                }

                _ => return Err(Error::DynSyntax { pos: abs, ch }),
            }
        }

        if !allow_binary {
            // The expression is empty or ends mid-operator.
            return Err(Error::TrailingOperator {
                pos: self.base + self.cursor.pos(),
            });
        }

        while let Some(op) = self.stack.pop() {
            match op {
                DcOp::LParen { pos } => return Err(Error::UnbalancedParen { pos }),
                DcOp::Not => self.tokens.push(DcToken::Not),
                DcOp::AssertTrue { target, .. } => {
                    self.tokens.push(DcToken::AssertTrue { target })
                }
            }
        }
        Ok(self.tokens)
    }

    /// Pop and emit stacked operators that bind tighter than `prec`.
    fn flush_ops(&mut self, prec: u8) {
        while let Some(top) = self.stack.last() {
            if matches!(top, DcOp::LParen { .. }) || top.prec() >= prec {
                break;
            }
            match self.stack.pop().unwrap() {
                DcOp::Not => self.tokens.push(DcToken::Not),
                DcOp::AssertTrue { target, .. } => {
                    self.tokens.push(DcToken::AssertTrue { target })
                }
                DcOp::LParen { .. } => unreachable!(),
            }
        }
    }

    /// `&&` or `||`; the first half has been consumed at `abs`.
    fn binary(&mut self, abs: usize, half: char) -> Result<(), Error> {
        match self.cursor.bump() {
            Some((_, ch)) if ch == half => {}
            Some(_) => return Err(Error::HalfOperator { pos: abs, ch: half }),
            None => return Err(Error::UnexpectedEnd),
        }

        self.next_target += 1;
        let target = self.next_target;
        let (prec, jump) = if half == '&' {
            (DC_PREC_AND, DcToken::JumpIfFalse { target })
        } else {
            (DC_PREC_OR, DcToken::JumpIfTrue { target })
        };

        self.flush_ops(prec);
        self.tokens.push(jump);
        self.stack.push(DcOp::AssertTrue { target, prec });
        Ok(())
    }

    fn rparen(&mut self, abs: usize) -> Result<(), Error> {
        loop {
            match self.stack.pop() {
                Some(DcOp::LParen { .. }) => return Ok(()),
                Some(DcOp::Not) => self.tokens.push(DcToken::Not),
                Some(DcOp::AssertTrue { target, .. }) => {
                    self.tokens.push(DcToken::AssertTrue { target })
                }
                None => return Err(Error::UnbalancedParen { pos: abs }),
            }
        }
    }

    /// `:name:` — the leading colon has been consumed.
    fn atom(&mut self) -> Result<(), Error> {
        let name_pos = self.base + self.cursor.pos();
        let mut name = String::new();
        loop {
            match self.cursor.bump() {
                Some((_, ':')) => break,
                Some((_, ch)) if is_graphic(ch) => name.push(ch),
                Some(_) => return Err(Error::NonGraphicName { pos: name_pos }),
                None => return Err(Error::UnexpectedEnd),
            }
        }
        self.tokens.push(DcToken::Class {
            name,
            pos: name_pos,
        });
        Ok(())
    }
}

/// One opcode of a compiled dynamic class.  Jump targets are resolved
/// opcode indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DynOp {
    PushClass(ClassIdx),
    PushIdentity(IdentIdx),
    Not,
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    AssertTrue,
}

/// A compiled dynamic class: a pure opcode program evaluating one
/// element to a boolean.  Atom references index the owning regex's
/// side tables, so the program itself is not generic.
#[derive(Debug)]
struct DynProgram {
    /// The original expression text, kept for labels and dumps.
    text: String,
    ops: Vec<DynOp>,
}

impl DynProgram {
    /// Evaluate the program against one element.
    ///
    /// Jumps peek at the top of the value stack and leave it there, so
    /// the `AssertTrue` pad they land on reads the value that caused
    /// the short-circuit.  The final top of stack is the verdict.
    fn matches<E: PartialEq>(
        &self,
        elem: &E,
        classes: &[ClassDef<E>],
        identities: &[IdentityDef<E>],
    ) -> bool {
        let mut stack: Vec<bool> = Vec::with_capacity(8);
        let mut pc = 0;
        while pc < self.ops.len() {
            match self.ops[pc] {
                DynOp::PushClass(class) => {
                    stack.push((classes[class.idx()].predicate)(elem));
                }
                DynOp::PushIdentity(ident) => {
                    stack.push(identities[ident.idx()].value == *elem);
                }
                DynOp::Not => {
                    let v = stack.pop().unwrap();
                    stack.push(!v);
                }
                DynOp::JumpIfFalse(target) => {
                    if !*stack.last().unwrap() {
                        pc = target;
                        continue;
                    }
                }
                DynOp::JumpIfTrue(target) => {
                    if *stack.last().unwrap() {
                        pc = target;
                        continue;
                    }
                }
                DynOp::AssertTrue => {}
            }
            pc += 1;
        }
        stack.pop().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// NFA states
// ---------------------------------------------------------------------------

/// Index into the NFA state array ([`Regex::states`]).
///
/// [`StateIdx::NONE`] marks a dangling, not-yet-patched out-pointer
/// during construction; a finished regex contains none.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct StateIdx(u32);

impl StateIdx {
    /// Sentinel for unpatched `out` pointers during construction.
    const NONE: Self = Self(u32::MAX);

    /// The raw index as `usize`.  Must not be called on `NONE`.
    #[inline]
    fn idx(self) -> usize {
        debug_assert!(self != Self::NONE, "StateIdx::NONE used as index");
        self.0 as usize
    }
}

impl fmt::Display for StateIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `states[state_idx]` — typed access to the NFA state array.
impl Index<StateIdx> for [State] {
    type Output = State;

    #[inline]
    fn index(&self, idx: StateIdx) -> &State {
        &self[idx.idx()]
    }
}

impl IndexMut<StateIdx> for [State] {
    #[inline]
    fn index_mut(&mut self, idx: StateIdx) -> &mut State {
        &mut self[idx.idx()]
    }
}

/// Index into the interned class table ([`Regex::classes`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ClassIdx(usize);

impl ClassIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0
    }
}

/// Index into the interned identity table ([`Regex::identities`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct IdentIdx(usize);

impl IdentIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0
    }
}

/// Index into the compiled dynamic-class table
/// ([`Regex::dyn_classes`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct DynClassIdx(usize);

impl DynClassIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0
    }
}

/// A single NFA state.
///
/// Consuming states (`Class`, `Identity`, `DynClass`, `Any`) are
/// stepped over in [`Executor::step`]; epsilon states (`Split` and the
/// anchors, when their condition holds) are followed during
/// [`Executor::addstate`].  The capture marks of a state live in the
/// parallel [`Regex::marks`] table so the state itself stays `Copy`.
#[derive(Clone, Copy, Debug)]
enum State {
    /// Match one element against an interned class predicate.
    Class {
        class: ClassIdx,
        negated: bool,
        out: StateIdx,
    },
    /// Match one element against an interned identity by equality.
    Identity {
        ident: IdentIdx,
        negated: bool,
        out: StateIdx,
    },
    /// Match one element against a compiled dynamic class.
    DynClass { prog: DynClassIdx, out: StateIdx },
    /// `.` — match any single element.
    Any { out: StateIdx },
    /// `^` — zero-width; followed only at the match start position.
    AssertBegin { out: StateIdx },
    /// `$` — zero-width; followed only once the input is exhausted.
    AssertEnd { out: StateIdx },
    /// Epsilon fork: follow both `out` and `out1`.
    Split { out: StateIdx, out1: StateIdx },
    /// The shared accepting state; every accept path ends here.
    Match,
}

/// Capture-group annotations of one state: the groups that open at
/// the element consumed by (or the closure crossing) this state, and
/// the groups that close there.
#[derive(Clone, Debug, Default)]
struct GroupMarks {
    starts: Vec<u32>,
    ends: Vec<u32>,
}

/// One dangling out-pointer of a fragment under construction;
/// `alt` selects `out1` of a `Split`.
#[derive(Clone, Copy, Debug)]
struct Dangle {
    state: StateIdx,
    alt: bool,
}

impl Dangle {
    fn out(state: StateIdx) -> Self {
        Self { state, alt: false }
    }

    fn out1(state: StateIdx) -> Self {
        Self { state, alt: true }
    }
}

/// A partially-built NFA fragment: an entry state, the dangling
/// out-pointers waiting to be patched to a successor, and the
/// group-close marks that will land on whichever state the dangles
/// are patched to.
#[derive(Debug)]
struct Fragment {
    start: StateIdx,
    dangles: Vec<Dangle>,
    pending_ends: Vec<u32>,
}

// ---------------------------------------------------------------------------
// NFA builder (postfix tokens -> graph)
// ---------------------------------------------------------------------------

/// An interned class used by a compiled regex: the registered name
/// plus a shared handle on its predicate.
struct ClassDef<E> {
    name: String,
    predicate: Predicate<E>,
}

impl<E> fmt::Debug for ClassDef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef").field("name", &self.name).finish()
    }
}

/// An interned identity used by a compiled regex.
#[derive(Debug)]
struct IdentityDef<E> {
    name: String,
    value: E,
}

/// Builds a [`Regex`] from a postfix token stream.
///
/// Classical Thompson construction over a fragment stack: operand
/// tokens push single-state fragments, operator tokens pop fragments
/// and wire them together, and after the whole stream exactly one
/// fragment remains, whose dangles are patched to the shared `Match`
/// state.
struct NfaBuilder<'c, E> {
    compiler: &'c Compiler<E>,
    states: Vec<State>,
    /// Capture marks, parallel to `states`.
    marks: Vec<GroupMarks>,
    frags: Vec<Fragment>,
    /// Interned atoms, keyed by name; the map index is the
    /// `ClassIdx` / `IdentIdx` stored in states and opcodes.
    classes: IndexMap<String, Predicate<E>>,
    identities: IndexMap<String, E>,
    dyn_classes: Vec<DynProgram>,
    group_count: u32,
    group_names: IndexMap<String, u32>,
}

impl<'c, E: Clone + PartialEq> NfaBuilder<'c, E> {
    fn new(compiler: &'c Compiler<E>) -> Self {
        Self {
            compiler,
            states: Vec::new(),
            marks: Vec::new(),
            frags: Vec::new(),
            classes: IndexMap::new(),
            identities: IndexMap::new(),
            dyn_classes: Vec::new(),
            group_count: 0,
            group_names: IndexMap::new(),
        }
    }

    /// Push a new NFA state (with empty marks) and return its index.
    fn state(&mut self, state: State) -> StateIdx {
        let idx = StateIdx(self.states.len() as u32);
        self.states.push(state);
        self.marks.push(GroupMarks::default());
        idx
    }

    /// Point every dangle at `target`, and land the fragment's
    /// pending group-close marks on it.
    fn patch(&mut self, dangles: &[Dangle], pending_ends: &[u32], target: StateIdx) {
        for d in dangles {
            match &mut self.states[d.state.idx()] {
                State::Class { out, .. }
                | State::Identity { out, .. }
                | State::DynClass { out, .. }
                | State::Any { out }
                | State::AssertBegin { out }
                | State::AssertEnd { out }
                    if !d.alt =>
                {
                    *out = target;
                }
                State::Split { out, out1 } => {
                    if d.alt {
                        *out1 = target;
                    } else {
                        *out = target;
                    }
                }
                other => panic!("patch: unexpected state {:?}", other),
            }
        }
        let ends = &mut self.marks[target.idx()].ends;
        for &g in pending_ends {
            if !ends.contains(&g) {
                ends.push(g);
            }
        }
    }

    /// Push a fragment consisting of one fresh state whose single
    /// dangle is its `out` pointer.
    fn leaf(&mut self, state: State) {
        let idx = self.state(state);
        self.frags.push(Fragment {
            start: idx,
            dangles: vec![Dangle::out(idx)],
            pending_ends: Vec::new(),
        });
    }

    /// Resolve a `[:name:]` reference into a `Class` or `Identity`
    /// state, interning the atom into the regex's side tables.
    fn atom_state(&mut self, name: &str, pos: usize, negated: bool) -> Result<State, Error> {
        match self.compiler.lookup(name) {
            Some(Atom::Class(predicate)) => {
                let (i, _) = self
                    .classes
                    .insert_full(name.to_owned(), Arc::clone(predicate));
                Ok(State::Class {
                    class: ClassIdx(i),
                    negated,
                    out: StateIdx::NONE,
                })
            }
            Some(Atom::Identity(value)) => {
                let (i, _) = self
                    .identities
                    .insert_full(name.to_owned(), value.clone());
                Ok(State::Identity {
                    ident: IdentIdx(i),
                    negated,
                    out: StateIdx::NONE,
                })
            }
            None => Err(Error::UnknownName {
                pos,
                name: name.to_owned(),
            }),
        }
    }

    /// Two-phase dynamic-class compilation: tokenise the expression to
    /// postfix, then lower it to opcodes, resolving atom names and
    /// patching jump targets to opcode indices.
    fn compile_dyn_class(&mut self, expr: &str, pos: usize) -> Result<DynClassIdx, Error> {
        let tokens = DcScanner::new(expr, pos).scan()?;

        let mut ops = Vec::with_capacity(tokens.len());
        // target id -> opcode index of its AssertTrue pad
        let mut pads: HashMap<usize, usize> = HashMap::new();
        // opcode index -> unresolved target id
        let mut patches: Vec<(usize, usize)> = Vec::new();

        for token in tokens {
            match token {
                DcToken::Class { name, pos } => match self.compiler.lookup(&name) {
                    Some(Atom::Class(predicate)) => {
                        let (i, _) = self
                            .classes
                            .insert_full(name, Arc::clone(predicate));
                        ops.push(DynOp::PushClass(ClassIdx(i)));
                    }
                    Some(Atom::Identity(value)) => {
                        let (i, _) = self.identities.insert_full(name, value.clone());
                        ops.push(DynOp::PushIdentity(IdentIdx(i)));
                    }
                    None => return Err(Error::UnknownName { pos, name }),
                },
                DcToken::Not => ops.push(DynOp::Not),
                DcToken::JumpIfFalse { target } => {
                    patches.push((ops.len(), target));
                    ops.push(DynOp::JumpIfFalse(0));
                }
                DcToken::JumpIfTrue { target } => {
                    patches.push((ops.len(), target));
                    ops.push(DynOp::JumpIfTrue(0));
                }
                DcToken::AssertTrue { target } => {
                    pads.insert(target, ops.len());
                    ops.push(DynOp::AssertTrue);
                }
            }
        }

        for (op_idx, target) in patches {
            let pad = pads[&target];
            match &mut ops[op_idx] {
                DynOp::JumpIfFalse(t) | DynOp::JumpIfTrue(t) => *t = pad,
                _ => unreachable!(),
            }
        }

        trace!("dyn-class {:?}: {} opcodes", expr, ops.len());
        let idx = DynClassIdx(self.dyn_classes.len());
        self.dyn_classes.push(DynProgram {
            text: expr.to_owned(),
            ops,
        });
        Ok(idx)
    }

    /// Consume one postfix token, updating the fragment stack.
    fn token2nfa(&mut self, token: &Token) -> Result<(), Error> {
        match token {
            Token::Class { name, pos, negated } => {
                let state = self.atom_state(name, *pos, *negated)?;
                self.leaf(state);
            }

            Token::DynClass { expr, pos } => {
                let prog = self.compile_dyn_class(expr, *pos)?;
                self.leaf(State::DynClass {
                    prog,
                    out: StateIdx::NONE,
                });
            }

            Token::Any => self.leaf(State::Any { out: StateIdx::NONE }),
            Token::AssertBegin => self.leaf(State::AssertBegin { out: StateIdx::NONE }),
            Token::AssertEnd => self.leaf(State::AssertEnd { out: StateIdx::NONE }),

            Token::Concat => {
                let e2 = self.frags.pop().unwrap();
                let e1 = self.frags.pop().unwrap();
                self.patch(&e1.dangles, &e1.pending_ends, e2.start);
                self.frags.push(Fragment {
                    start: e1.start,
                    dangles: e2.dangles,
                    pending_ends: e2.pending_ends,
                });
            }

            Token::Alternate => {
                let e2 = self.frags.pop().unwrap();
                let e1 = self.frags.pop().unwrap();
                let split = self.state(State::Split {
                    out: e1.start,
                    out1: e2.start,
                });
                let mut dangles = e1.dangles;
                dangles.extend(e2.dangles);
                self.frags.push(Fragment {
                    start: split,
                    dangles,
                    pending_ends: Vec::new(),
                });
            }

            Token::Question => {
                let e = self.frags.pop().unwrap();
                let split = self.state(State::Split {
                    out: e.start,
                    out1: StateIdx::NONE,
                });
                let mut dangles = e.dangles;
                dangles.push(Dangle::out1(split));
                // The pending ends stay on the fragment: whichever
                // state the dangles are patched to closes the group,
                // on the taken path and the skipped one alike.
                self.frags.push(Fragment {
                    start: split,
                    dangles,
                    pending_ends: e.pending_ends,
                });
            }

            Token::Star => {
                let e = self.frags.pop().unwrap();
                let split = self.state(State::Split {
                    out: e.start,
                    out1: StateIdx::NONE,
                });
                self.patch(&e.dangles, &e.pending_ends, split);
                self.frags.push(Fragment {
                    start: split,
                    dangles: vec![Dangle::out1(split)],
                    pending_ends: Vec::new(),
                });
            }

            Token::Plus => {
                let e = self.frags.pop().unwrap();
                let split = self.state(State::Split {
                    out: e.start,
                    out1: StateIdx::NONE,
                });
                self.patch(&e.dangles, &e.pending_ends, split);
                self.frags.push(Fragment {
                    start: e.start,
                    dangles: vec![Dangle::out1(split)],
                    pending_ends: Vec::new(),
                });
            }

            Token::EndGroup { num, name } => {
                let top = self.frags.last_mut().unwrap();
                self.marks[top.start.idx()].starts.push(*num);
                top.pending_ends.push(*num);
                self.group_count = self.group_count.max(*num);
                if let Some(name) = name {
                    // Duplicates were rejected by the scanner.
                    self.group_names.insert(name.clone(), *num);
                }
            }
        }
        Ok(())
    }

    /// Drive the construction and produce the finished [`Regex`].
    fn build(mut self, tokens: &[Token]) -> Result<Regex<E>, Error> {
        for token in tokens {
            trace!("token2nfa: {:?}", token);
            self.token2nfa(token)?;
        }

        // An empty pattern produces no fragments; it matches the
        // empty sequence, which a bare Match state expresses.
        let (start, match_state) = if let Some(e) = self.frags.pop() {
            assert!(self.frags.is_empty(), "construction left extra fragments");
            let m = self.state(State::Match);
            self.patch(&e.dangles, &e.pending_ends, m);
            (e.start, m)
        } else {
            let m = self.state(State::Match);
            (m, m)
        };

        let hints = compute_hints(&self.states, start);

        debug!(
            "compiled {} states, {} groups, {} dyn-classes",
            self.states.len(),
            self.group_count,
            self.dyn_classes.len()
        );

        Ok(Regex {
            states: StateList(self.states.into_boxed_slice()),
            marks: self.marks.into_boxed_slice(),
            start,
            match_state,
            classes: self
                .classes
                .into_iter()
                .map(|(name, predicate)| ClassDef { name, predicate })
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            identities: self
                .identities
                .into_iter()
                .map(|(name, value)| IdentityDef { name, value })
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            dyn_classes: self.dyn_classes.into_boxed_slice(),
            group_count: self.group_count as usize,
            group_names: Arc::new(self.group_names),
            hints,
        })
    }
}

// ---------------------------------------------------------------------------
// Search hints
// ---------------------------------------------------------------------------

/// Read-only facts about the NFA entry, computed once at build time
/// and consulted by [`Regex::search_at`].
#[derive(Debug)]
struct Hints {
    /// Every pre-atom path from the root passes `AssertBegin`: the
    /// pattern can only ever match at the position a match starts.
    anchored_start: bool,
    /// The consuming states reachable from the root without consuming
    /// anything — the candidates for a match's first element.
    firsts: Box<[StateIdx]>,
    /// The seed closure already contains `Match`: the pattern accepts
    /// the empty sequence, so no input position can be skipped.
    can_match_empty: bool,
}

fn compute_hints(states: &[State], start: StateIdx) -> Hints {
    // Anchoring: walk from the root through Split forks only.  If
    // every leaf of that walk is AssertBegin, nothing can be matched
    // without first passing the anchor.
    let mut anchored = true;
    let mut seen = vec![false; states.len()];
    let mut stack = vec![start];
    while let Some(idx) = stack.pop() {
        if seen[idx.idx()] {
            continue;
        }
        seen[idx.idx()] = true;
        match states[idx] {
            State::Split { out, out1 } => {
                stack.push(out);
                stack.push(out1);
            }
            State::AssertBegin { .. } => {}
            _ => anchored = false,
        }
    }

    // First-element candidates: the seed epsilon closure.  At the
    // seed position `AssertBegin` always holds, so it is crossed;
    // `AssertEnd` never holds there.
    let mut firsts = Vec::new();
    let mut can_match_empty = false;
    seen.fill(false);
    stack.push(start);
    while let Some(idx) = stack.pop() {
        if seen[idx.idx()] {
            continue;
        }
        seen[idx.idx()] = true;
        match states[idx] {
            State::Split { out, out1 } => {
                stack.push(out);
                stack.push(out1);
            }
            State::AssertBegin { out } => stack.push(out),
            State::AssertEnd { .. } => {}
            State::Match => can_match_empty = true,
            _ => firsts.push(idx),
        }
    }

    Hints {
        anchored_start: anchored,
        firsts: firsts.into_boxed_slice(),
        can_match_empty,
    }
}

// ---------------------------------------------------------------------------
// Compiled regex
// ---------------------------------------------------------------------------

struct StateList(Box<[State]>);

impl fmt::Debug for StateList {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_map().entries(self.0.iter().enumerate()).finish()
    }
}

impl std::ops::Deref for StateList {
    type Target = [State];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A compiled pattern, ready for matching.
///
/// Immutable after construction: one `Regex` can run any number of
/// concurrent matches, each with its own per-invocation state.
#[derive(Debug)]
pub struct Regex<E> {
    states: StateList,
    /// Capture marks, parallel to `states`.
    marks: Box<[GroupMarks]>,
    start: StateIdx,
    /// The shared accepting state.
    match_state: StateIdx,
    /// Interned class atoms referenced by `State::Class` and
    /// dyn-class opcodes.
    classes: Box<[ClassDef<E>]>,
    /// Interned identity atoms.
    identities: Box<[IdentityDef<E>]>,
    /// Compiled dynamic-class programs.
    dyn_classes: Box<[DynProgram]>,
    /// Number of capture groups (`(` count in the pattern).
    group_count: usize,
    /// Named-group lookup, shared with every `Match` produced.
    group_names: Arc<IndexMap<String, u32>>,
    hints: Hints,
}

impl<E> Regex<E> {
    /// Number of capture groups in the pattern.
    pub fn group_count(&self) -> usize {
        self.group_count
    }

    /// `true` when the pattern starts with an unavoidable `^`, so a
    /// search degenerates to a single anchored attempt.
    pub fn only_matches_at_beginning(&self) -> bool {
        self.hints.anchored_start
    }

    /// Emit a GraphViz DOT rendering of the NFA.
    pub fn to_dot(&self, mut buffer: impl Write) -> io::Result<()> {
        writeln!(buffer, "digraph nfa {{")?;
        writeln!(buffer, "\trankdir=LR;")?;
        writeln!(buffer, "\troot [shape=point];")?;
        writeln!(buffer, "\troot -> N{};", self.start)?;

        let mut visited = vec![false; self.states.len()];
        let mut stack = vec![self.start];
        while let Some(idx) = stack.pop() {
            if visited[idx.idx()] {
                continue;
            }
            visited[idx.idx()] = true;

            let marks = &self.marks[idx.idx()];
            let label = format!(
                "{}\\nsr:{:?} er:{:?}",
                self.state_label(idx),
                marks.starts,
                marks.ends
            );
            if matches!(self.states[idx], State::Match) {
                writeln!(buffer, "\tN{} [label=\"{}\" peripheries=2];", idx, label)?;
            } else {
                writeln!(buffer, "\tN{} [label=\"{}\"];", idx, label)?;
            }

            match self.states[idx] {
                State::Class { out, .. }
                | State::Identity { out, .. }
                | State::DynClass { out, .. }
                | State::Any { out }
                | State::AssertBegin { out }
                | State::AssertEnd { out } => {
                    writeln!(buffer, "\tN{} -> N{};", idx, out)?;
                    stack.push(out);
                }
                State::Split { out, out1 } => {
                    writeln!(buffer, "\tN{} -> N{};", idx, out)?;
                    writeln!(buffer, "\tN{} -> N{};", idx, out1)?;
                    stack.push(out);
                    stack.push(out1);
                }
                State::Match => {}
            }
        }
        writeln!(buffer, "}}")?;
        Ok(())
    }

    /// Write the DOT rendering to a file, for `dot -Tsvg` and friends.
    pub fn write_dot(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::create(path)?;
        self.to_dot(BufWriter::new(file))
    }

    fn state_label(&self, idx: StateIdx) -> String {
        fn escape(s: &str) -> String {
            s.replace('\\', "\\\\").replace('"', "\\\"")
        }
        match &self.states[idx] {
            State::Class { class, negated, .. } => {
                let name = &self.classes[class.idx()].name;
                if *negated {
                    format!("!{}", escape(name))
                } else {
                    escape(name)
                }
            }
            State::Identity { ident, negated, .. } => {
                let name = &self.identities[ident.idx()].name;
                if *negated {
                    format!("!{}", escape(name))
                } else {
                    escape(name)
                }
            }
            State::DynClass { prog, .. } => {
                format!("[{}]", escape(&self.dyn_classes[prog.idx()].text))
            }
            State::Any { .. } => "ANY".to_owned(),
            State::AssertBegin { .. } => "^".to_owned(),
            State::AssertEnd { .. } => "$".to_owned(),
            State::Split { .. } => "SPLIT".to_owned(),
            State::Match => "MATCH".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator (Pike-style NFA simulation with capture registers)
// ---------------------------------------------------------------------------

/// One capture register array: a [`Span`] per group, `Span::NONE`
/// until the group participates.
type Registers = Box<[Span]>;

/// A live simulation thread: an NFA state plus its own view of the
/// capture registers.
#[derive(Clone, Debug)]
struct Thread {
    state: StateIdx,
    regs: Registers,
}

/// Fire a state's capture marks as the epsilon closure crosses it at
/// `pos` (the index of the element consumed just before): the next
/// element opens the group at `pos + 1`; a close fires there too, but
/// only for groups whose start participated — a `*` skipping its body
/// must not close a group that never opened.
fn apply_closure_marks(marks: &GroupMarks, regs: &mut [Span], pos: isize) {
    for &g in &marks.starts {
        regs[(g - 1) as usize].start = pos + 1;
    }
    for &g in &marks.ends {
        let r = &mut regs[(g - 1) as usize];
        if r.start != -1 {
            r.end = pos + 1;
        }
    }
}

/// Per-invocation simulation state.  Everything here is allocated
/// fresh for one `exec` call and dropped on return, which is what
/// makes a shared [`Regex`] safe to run concurrently.
struct Executor<'r, E> {
    regex: &'r Regex<E>,
    /// Per-state stamp of the `listid` the state was last added in:
    /// O(1) deduplication for `addstate`.
    lastlist: Vec<usize>,
    /// Monotonically increasing step id.
    listid: usize,
    /// Current and next thread lists, swapped every step.
    clist: Vec<Thread>,
    nlist: Vec<Thread>,
    /// `start - 1`: the position "before" the first element, where
    /// `AssertBegin` holds.
    pre_pos: isize,
    /// Set by [`finish`](Executor::finish); lets `addstate` follow
    /// `AssertEnd`.
    at_end: bool,
}

impl<'r, E: PartialEq> Executor<'r, E> {
    /// Seed the executor: epsilon-close the root into `clist` with a
    /// fresh register array.
    fn new(regex: &'r Regex<E>, start: usize) -> Self {
        let mut ex = Self {
            regex,
            lastlist: vec![usize::MAX; regex.states.len()],
            listid: 0,
            clist: Vec::new(),
            nlist: Vec::new(),
            pre_pos: start as isize - 1,
            at_end: false,
        };
        let regs = vec![Span::NONE; regex.group_count].into_boxed_slice();
        ex.addstate(ex.pre_pos, regex.start, regs);
        std::mem::swap(&mut ex.clist, &mut ex.nlist);
        ex.listid += 1;
        ex
    }

    /// Follow epsilon transitions from `idx`, adding every reachable
    /// non-epsilon state to `nlist` with its own register copy.
    ///
    /// Insertion order is the thread priority: `Split.out` is
    /// explored before `Split.out1`, and the first thread to claim a
    /// state in a step keeps its registers.
    fn addstate(&mut self, pos: isize, idx: StateIdx, mut regs: Registers) {
        if self.lastlist[idx.idx()] == self.listid {
            return;
        }
        self.lastlist[idx.idx()] = self.listid;

        let regex = self.regex;
        match regex.states[idx] {
            State::Split { out, out1 } => {
                apply_closure_marks(&regex.marks[idx.idx()], &mut regs, pos);
                self.addstate(pos, out, regs.clone());
                self.addstate(pos, out1, regs);
            }
            State::AssertBegin { out } => {
                if pos == self.pre_pos {
                    apply_closure_marks(&regex.marks[idx.idx()], &mut regs, pos);
                    self.addstate(pos, out, regs);
                }
                // Past the start the anchor can never hold again; the
                // thread dies here.
            }
            State::AssertEnd { out } if self.at_end => {
                apply_closure_marks(&regex.marks[idx.idx()], &mut regs, pos);
                self.addstate(pos, out, regs);
            }
            // Consuming states, Match, and a blocked AssertEnd wait
            // in the list for step()/ismatch()/finish().
            _ => self.nlist.push(Thread { state: idx, regs }),
        }
    }

    /// Advance the simulation past the element at `pos`: every thread
    /// whose state consumes it is epsilon-closed into the next list.
    fn step(&mut self, pos: usize, elem: &E) {
        self.listid += 1;
        self.nlist.clear();
        let clist = std::mem::take(&mut self.clist);
        let regex = self.regex;

        for th in &clist {
            let (matched, out) = match regex.consumes(th.state, elem) {
                Some(hit) => hit,
                None => continue,
            };
            if !matched {
                continue;
            }
            let mut regs = th.regs.clone();
            let marks = &regex.marks[th.state.idx()];
            for &g in &marks.starts {
                let r = &mut regs[(g - 1) as usize];
                // A looping group keeps its original opening position.
                if r.start == -1 {
                    r.start = pos as isize;
                }
            }
            for &g in &marks.ends {
                regs[(g - 1) as usize].end = pos as isize;
            }
            self.addstate(pos as isize, out, regs);
        }

        self.clist = std::mem::replace(&mut self.nlist, clist);
        trace!("step {}: {} live threads", pos, self.clist.len());
    }

    /// Return the registers of the highest-priority accepted thread,
    /// if any, firing the accept state's group-close marks at `pos`
    /// (the post-consumption position).
    fn ismatch(&mut self, pos: isize) -> Option<Registers> {
        let regex = self.regex;
        for th in self.clist.iter_mut() {
            if th.state == regex.match_state {
                for &g in &regex.marks[regex.match_state.idx()].ends {
                    th.regs[(g - 1) as usize].end = pos;
                }
                return Some(th.regs.clone());
            }
        }
        None
    }

    /// Signal end-of-input: threads waiting on `AssertEnd` follow
    /// their out-pointers (with marks firing) and the newly reachable
    /// states are appended to `clist`, after the existing threads so
    /// that priorities are preserved.
    fn finish(&mut self, pos: isize) {
        self.at_end = true;
        self.listid += 1;
        self.nlist.clear();
        let regex = self.regex;

        for i in 0..self.clist.len() {
            if let State::AssertEnd { out } = regex.states[self.clist[i].state] {
                let mut regs = self.clist[i].regs.clone();
                apply_closure_marks(&regex.marks[self.clist[i].state.idx()], &mut regs, pos);
                self.addstate(pos, out, regs);
            }
        }

        let mut expanded = std::mem::take(&mut self.nlist);
        self.clist.append(&mut expanded);
        self.nlist = expanded;
    }
}

// ---------------------------------------------------------------------------
// Matching facade
// ---------------------------------------------------------------------------

impl<E: PartialEq> Regex<E> {
    /// Match against the input, starting at position 0.  Reports the
    /// longest prefix accepted from there; the match may end before
    /// the input does.
    pub fn find(&self, input: &[E]) -> Match {
        self.exec(input, 0, false)
    }

    /// Like [`find`](Regex::find), starting at `start`.
    pub fn find_at(&self, input: &[E], start: usize) -> Match {
        self.exec(input, start, false)
    }

    /// Match against the input, requiring every element from position
    /// 0 to the end to be consumed.
    pub fn full_match(&self, input: &[E]) -> Match {
        self.exec(input, 0, true)
    }

    /// Like [`full_match`](Regex::full_match), starting at `start`.
    pub fn full_match_at(&self, input: &[E], start: usize) -> Match {
        self.exec(input, start, true)
    }

    /// Try [`find_at`](Regex::find_at) at every position from 0 and
    /// report the first success.
    pub fn search(&self, input: &[E]) -> Match {
        self.search_at(input, 0)
    }

    /// Try [`find_at`](Regex::find_at) at every position from `start`
    /// and report the first success.
    ///
    /// An `^`-anchored pattern degenerates to a single attempt at
    /// `start`.  Otherwise positions whose element cannot satisfy any
    /// first-element candidate of the pattern are skipped without
    /// simulation.
    pub fn search_at(&self, input: &[E], start: usize) -> Match {
        if self.hints.anchored_start {
            return self.find_at(input, start);
        }
        for pos in start..input.len() {
            if !self.hints.can_match_empty && !self.first_can_match(&input[pos]) {
                continue;
            }
            let m = self.find_at(input, pos);
            if m.success() {
                return m;
            }
        }
        Match::failure(Arc::clone(&self.group_names))
    }

    /// Evaluate a consuming state against one element.  `None` for
    /// epsilon states.
    fn consumes(&self, idx: StateIdx, elem: &E) -> Option<(bool, StateIdx)> {
        match self.states[idx] {
            State::Class {
                class,
                negated,
                out,
            } => Some(((self.classes[class.idx()].predicate)(elem) != negated, out)),
            State::Identity {
                ident,
                negated,
                out,
            } => Some(((self.identities[ident.idx()].value == *elem) != negated, out)),
            State::DynClass { prog, out } => Some((
                self.dyn_classes[prog.idx()].matches(elem, &self.classes, &self.identities),
                out,
            )),
            State::Any { out } => Some((true, out)),
            _ => None,
        }
    }

    fn first_can_match(&self, elem: &E) -> bool {
        self.hints
            .firsts
            .iter()
            .any(|&idx| matches!(self.consumes(idx, elem), Some((true, _))))
    }

    /// The shared driver behind the public entry points.
    ///
    /// Unanchored mode runs until the input is exhausted or no thread
    /// survives a step, remembering the longest accept seen; anchored
    /// mode only reports an accept that consumed everything.  Both
    /// give `$` a chance to fire once the input is exhausted.
    fn exec(&self, input: &[E], start: usize, anchored_end: bool) -> Match {
        if start > input.len() {
            return Match::failure(Arc::clone(&self.group_names));
        }
        let mut ex = Executor::new(self, start);
        trace!("exec at {}: {} seed threads", start, ex.clist.len());

        // (end position, registers) of the longest accept so far.
        let mut hit: Option<(usize, Registers)> = None;
        if !anchored_end {
            if let Some(regs) = ex.ismatch(start as isize) {
                hit = Some((start, regs));
            }
        }

        let mut dead = false;
        for pos in start..input.len() {
            if ex.clist.is_empty() {
                dead = true;
                break;
            }
            ex.step(pos, &input[pos]);
            if !anchored_end {
                if let Some(regs) = ex.ismatch(pos as isize + 1) {
                    hit = Some((pos + 1, regs));
                }
            }
        }

        if !dead {
            // End of input: let $ fire, then look for a thread that
            // consumed everything.
            ex.finish(input.len() as isize - 1);
            if let Some(regs) = ex.ismatch(input.len() as isize) {
                return self.matched(start, input.len(), regs);
            }
        }
        if let Some((end, regs)) = hit {
            return self.matched(start, end, regs);
        }
        Match::failure(Arc::clone(&self.group_names))
    }

    fn matched(&self, start: usize, end: usize, mut regs: Registers) -> Match {
        // Register hygiene: a half-set register can be left by a path
        // that opened a group but accepted elsewhere; a zero-length
        // one by a skipped optional.  Both report "absent".
        for r in regs.iter_mut() {
            if r.start == -1 || r.end == -1 || r.start == r.end {
                *r = Span::NONE;
            }
        }
        Match {
            success: true,
            span: Span {
                start: start as isize,
                end: end as isize,
            },
            registers: regs,
            group_names: Arc::clone(&self.group_names),
        }
    }
}

// ---------------------------------------------------------------------------
// Match results
// ---------------------------------------------------------------------------

/// The result of a matching call.
///
/// An unsuccessful match carries no registers; every accessor returns
/// the "absent" answer rather than panicking.
#[derive(Clone, Debug)]
pub struct Match {
    success: bool,
    span: Span,
    registers: Box<[Span]>,
    group_names: Arc<IndexMap<String, u32>>,
}

impl Match {
    fn failure(group_names: Arc<IndexMap<String, u32>>) -> Self {
        Self {
            success: false,
            span: Span::NONE,
            registers: Box::new([]),
            group_names,
        }
    }

    /// Did the regex find something?
    pub fn success(&self) -> bool {
        self.success
    }

    /// The span of the whole match.  [`Span::NONE`] on failure.
    pub fn span(&self) -> Span {
        self.span
    }

    /// Number of elements covered by the whole match.
    pub fn len(&self) -> usize {
        self.span.len()
    }

    /// `true` when the match covers no elements (which includes the
    /// unsuccessful case).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The span of capture group `n`.  Groups number from 1 in the
    /// textual order of `(`.  Returns [`Span::NONE`] for a group that
    /// did not participate, an out-of-range number, or a failed
    /// match — never panics.
    pub fn group(&self, n: usize) -> Span {
        if self.success && n >= 1 && n <= self.registers.len() {
            self.registers[n - 1]
        } else {
            Span::NONE
        }
    }

    /// The span of the named capture group, or [`Span::NONE`] if the
    /// name does not exist or the group did not participate.
    pub fn group_name(&self, name: &str) -> Span {
        match self.group_names.get(name) {
            Some(&n) => self.group(n as usize),
            None => Span::NONE,
        }
    }

    /// Whether capture group `n` participated in the match.
    pub fn has_group(&self, n: usize) -> bool {
        !self.group(n).is_none()
    }

    /// Whether the named capture group participated in the match.
    pub fn has_group_name(&self, name: &str) -> bool {
        !self.group_name(name).is_none()
    }

    /// Number of capture groups the pattern defines (0 for a failed
    /// match, which carries no registers).
    pub fn group_count(&self) -> usize {
        self.registers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
