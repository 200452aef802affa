use logos::Logos;
use std::fmt;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*[^/])*\*/")]
pub enum Token {
    // Keywords
    #[token("class")]
    Class,
    #[token("struct")]
    Struct,
    #[token("interface")]
    Interface,
    #[token("enum")]
    Enum,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("return")]
    Return,
    #[token("try")]
    Try,
    #[token("catch")]
    Catch,
    #[token("new")]
    New,
    #[token("this")]
    This,
    #[token("null")]
    Null,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("void")]
    Void,

    // Modifiers (parsed and mostly ignored)
    #[token("public")]
    Public,
    #[token("private")]
    Private,
    #[token("protected")]
    Protected,
    #[token("internal")]
    Internal,
    #[token("static")]
    Static,
    #[token("sealed")]
    Sealed,
    #[token("virtual")]
    Virtual,
    #[token("override")]
    Override,
    #[token("readonly")]
    Readonly,

    // Literals
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    FloatLit(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i32>().ok())]
    IntLit(i32),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        Some(unescape(&s[1..s.len() - 1]))
    })]
    StringLit(String),

    // Identifiers
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // Operators
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("!")]
    Bang,
    #[token("=")]
    Eq,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(".")]
    Dot,
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('0') => out.push('\0'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Token::Class => "'class'",
            Token::Struct => "'struct'",
            Token::Interface => "'interface'",
            Token::Enum => "'enum'",
            Token::If => "'if'",
            Token::Else => "'else'",
            Token::While => "'while'",
            Token::Return => "'return'",
            Token::Try => "'try'",
            Token::Catch => "'catch'",
            Token::New => "'new'",
            Token::This => "'this'",
            Token::Null => "'null'",
            Token::True => "'true'",
            Token::False => "'false'",
            Token::Void => "'void'",
            Token::Public => "'public'",
            Token::Private => "'private'",
            Token::Protected => "'protected'",
            Token::Internal => "'internal'",
            Token::Static => "'static'",
            Token::Sealed => "'sealed'",
            Token::Virtual => "'virtual'",
            Token::Override => "'override'",
            Token::Readonly => "'readonly'",
            Token::FloatLit(_) => "float literal",
            Token::IntLit(_) => "integer literal",
            Token::StringLit(_) => "string literal",
            Token::Ident => "identifier",
            Token::PlusPlus => "'++'",
            Token::MinusMinus => "'--'",
            Token::Plus => "'+'",
            Token::Minus => "'-'",
            Token::Star => "'*'",
            Token::Slash => "'/'",
            Token::Percent => "'%'",
            Token::EqEq => "'=='",
            Token::BangEq => "'!='",
            Token::LtEq => "'<='",
            Token::GtEq => "'>='",
            Token::Lt => "'<'",
            Token::Gt => "'>'",
            Token::AmpAmp => "'&&'",
            Token::PipePipe => "'||'",
            Token::Bang => "'!'",
            Token::Eq => "'='",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::LBrace => "'{'",
            Token::RBrace => "'}'",
            Token::LBracket => "'['",
            Token::RBracket => "']'",
            Token::Comma => "','",
            Token::Semi => "';'",
            Token::Dot => "'.'",
        };
        f.write_str(s)
    }
}
