// https://www.rfc-editor.org/rfc/rfc2234#section-2.3
// https://www.rfc-editor.org/rfc/rfc3501#section-9
//
// The response grammar below is a PEG over bytes. Parsers are only invoked
// once the stream layer has buffered at least one complete response
// (including literal payloads), so a parse failure means "not this response
// type", never "read more".

use std::{borrow, str};

// Inclusive.
#[derive(Debug, PartialEq)]
pub struct Range(pub u32, pub u32);

#[derive(Debug, PartialEq)]
pub enum Mailbox<'input> {
  Inbox,
  Other(borrow::Cow<'input, [u8]>),
}

#[derive(Debug, PartialEq)]
pub enum Cond {
  Ok,
  No,
  Bad,
  Bye,
  Preauth,
}

#[derive(Debug, PartialEq)]
pub enum RespCode<'input> {
  Alert,
  TryCreate,
  ReadOnly,
  UidValidity(u32),
  UidNext(u32),
  AppendUid(u32, u32),
  CopyUid(u32, Vec<Range>, Vec<Range>),
  // Deliberately limited to literal-free input.
  PermanentFlags(Vec<&'input [u8]>),
  Capability(Vec<&'input [u8]>),
  Other(&'input [u8]),
}

#[derive(Debug, PartialEq)]
pub struct CondState<'input> {
  pub cond: Cond,
  pub code: Option<RespCode<'input>>,
  pub text: &'input [u8],
}

#[derive(Debug, PartialEq)]
pub enum FetchAtt<'input> {
  Uid(u32),
  Flags(Vec<&'input [u8]>),
  InternalDate(Vec<u8>),
  Rfc822Size(u32),
  Body(Option<borrow::Cow<'input, [u8]>>),
  Header(Option<borrow::Cow<'input, [u8]>>),
}

#[derive(Debug, PartialEq)]
pub enum Untagged<'input> {
  Capability(Vec<&'input [u8]>),
  List {
    flags: Vec<&'input [u8]>,
    delimiter: Option<u8>,
    mailbox: Mailbox<'input>,
  },
  Flags(Vec<&'input [u8]>),
  // First personal namespace: (prefix, delimiter).
  Namespace(Option<(Vec<u8>, Option<u8>)>),
  Exists(u32),
  Recent(u32),
  ExpungeSeq(u32),
  Fetch(u32, Vec<FetchAtt<'input>>),
  Cond(CondState<'input>),
}

fn parse_number(n: &[u8]) -> u32 {
  // Guaranteed by the BNF to be ASCII digits.
  str::from_utf8(n).unwrap().parse().unwrap_or(u32::MAX)
}

// The naive l:$(CHAR8()*<{n}>) in literal() would push every byte into a
// vector before discarding it: https://github.com/kevinmehall/rust-peg/pull/292
// Instead, use an undocumented escape hatch to do a fast skip:
// https://github.com/kevinmehall/rust-peg/issues/284
trait ParserHacks {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()>;
}

impl ParserHacks for [u8] {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()> {
    if self.len() >= position + n {
      return peg::RuleResult::Matched(position + n, ());
    }
    peg::RuleResult::Failed
  }
}

peg::parser! {
  pub grammar response() for [u8] {
    // CR = %x0D
    rule CR() = "\r"
    // LF = %x0A
    rule LF() = "\n"
    // CRLF = CR LF
    rule CRLF() = CR() LF()
    // CHAR = %x01-7F
    rule CHAR() -> u8
      = [b'\x01'..=b'\x7f']
    // CTL = %x00-1F / %x7F
    rule CTL() = [b'\x00'..=b'\x1f'] / "\x7f"
    // DQUOTE = %x22
    rule DQUOTE() -> u8
      = "\""
      { b'"' }
    rule SP() = " "
    // TEXT-CHAR = <any CHAR except CR and LF>
    rule TEXT_CHAR() -> u8
      = !(CR() / LF()) c:CHAR()
      { c }
    // DIGIT = %x30-39
    rule DIGIT() = [b'\x30'..=b'\x39']
    // digit-nz = %x31-39
    rule digit_nz() = [b'\x31'..=b'\x39']

    // number = 1*DIGIT
    rule number() -> u32
      = n:$(DIGIT()+)
      { parse_number(n) }
    // nz-number = digit-nz *DIGIT
    rule nz_number() -> u32
      = n:$(digit_nz() DIGIT()*)
      { parse_number(n) }
    // uniqueid = nz-number
    rule uniqueid() -> u32 = nz_number()
    // text = 1*TEXT-CHAR
    rule text() -> &'input [u8] = $(TEXT_CHAR()+)

    // nil = "NIL"
    rule nil() = "NIL"
    // list-wildcards = "%" / "*"
    rule list_wildcards() = "%" / "*"
    // quoted-specials = DQUOTE / "\"
    rule quoted_specials() -> u8
      = c:(DQUOTE() / ("\\" { b'\\' }))
      { c }
    // QUOTED-CHAR = <any TEXT-CHAR except quoted-specials> / "\" quoted-specials
    rule QUOTED_CHAR() -> u8
      = !quoted_specials() c:TEXT_CHAR() { c } / "\\" c:quoted_specials()
      { c }
    // resp-specials = "]"
    rule resp_specials() = "]"
    // atom-specials = "(" / ")" / "{" / SP / CTL / list-wildcards / quoted-specials / resp-specials
    rule atom_specials() = "(" / ")" / "{" / SP() / CTL() / list_wildcards() / quoted_specials() / resp_specials()
    // ATOM-CHAR = <any CHAR except atom-specials>
    rule ATOM_CHAR() = !atom_specials() CHAR()
    // atom = 1*ATOM-CHAR
    rule atom() = ATOM_CHAR()+
    // ASTRING-CHAR = ATOM-CHAR / resp-specials
    rule ASTRING_CHAR() = ATOM_CHAR() / resp_specials()
    // quoted = DQUOTE *QUOTED-CHAR DQUOTE
    rule quoted() -> Vec<u8>
      = DQUOTE() q:(QUOTED_CHAR()*) DQUOTE()
      { q }
    // literal = "{" number "}" CRLF *CHAR8
    rule literal() -> &'input [u8]
      = "{" n:number() "}" CRLF() position!() l:$(##skip(usize::try_from(n).unwrap()))
      { l }
    // string = quoted / literal
    rule string() -> borrow::Cow<'input, [u8]>
      = q:quoted() { borrow::Cow::Owned(q) } / l:literal() { borrow::Cow::Borrowed(l) }
    // astring = 1*ASTRING-CHAR / string
    rule astring() -> borrow::Cow<'input, [u8]>
      = s:$(ASTRING_CHAR()+) { borrow::Cow::Borrowed(s) } / s:string() { s }
    // nstring = string / nil
    rule nstring() -> Option<borrow::Cow<'input, [u8]>>
      = s:string() { Some(s) } / nil() { None }

    // tag = 1*<any ASTRING-CHAR except "+">
    rule tag() -> &'input [u8] = $((!"+" ASTRING_CHAR())+)

    // auth-type = atom
    rule auth_type() = atom()
    // capability = ("AUTH=" auth-type) / atom
    rule capability() -> &'input [u8] = $(("AUTH=" auth_type()) / atom())
    // capability-data = "CAPABILITY" *(SP capability) SP "IMAP4rev1" *(SP capability)
    // Rewritten for simplicity and to avoid backtracking (capability can match "IMAP4rev1").
    rule capability_data() -> Vec<&'input [u8]>
      = "CAPABILITY" cs:(SP() c:capability() { c })+
      { cs }

    // mailbox = "INBOX" / astring
    rule mailbox() -> Mailbox<'input>
      = ("i" / "I") ("n" / "N") ("b" / "B") ("o" / "O") ("x" / "X") !ASTRING_CHAR() { Mailbox::Inbox }
      / m:astring() { Mailbox::Other(m) }
    // mbx-list-flags, rewritten for simplicity.
    rule mbx_list_flags() -> Vec<&'input [u8]>
      = fs:((f:$("\\" atom()) { f }) ** SP())
      { fs }
    // mailbox-list = "(" [mbx-list-flags] ")" SP (DQUOTE QUOTED-CHAR DQUOTE / nil) SP mailbox
    rule mailbox_list() -> (Vec<&'input [u8]>, Option<u8>, Mailbox<'input>)
      = "(" fs:mbx_list_flags() ")" SP() c:(DQUOTE() c:QUOTED_CHAR() DQUOTE() { Some(c) } / nil() { None }) SP() m:mailbox()
      { (fs, c, m) }

    // flag-keyword = atom
    rule flag_keyword() -> &'input [u8] = $(atom())
    // flag-extension = "\" atom
    rule flag_extension() -> &'input [u8] = $("\\" atom())
    // flag = "\Answered" / "\Flagged" / "\Deleted" / "\Seen" / "\Draft" / flag-keyword / flag-extension
    rule flag() -> &'input [u8] = flag_keyword() / flag_extension()
    // flag-perm = flag / "\*"
    rule flag_perm() -> &'input [u8] = f:flag() { f } / $("\\*")
    // flag-fetch = flag / "\Recent"
    rule flag_fetch() -> &'input [u8] = flag()

    // https://www.rfc-editor.org/rfc/rfc4315#section-4
    // uid-range = (uniqueid ":" uniqueid); 2:4 and 4:2 are equivalent.
    rule uid_range() -> Range
      = u1:uniqueid() ":" u2:uniqueid()
      { if u1 <= u2 { Range(u1, u2) } else { Range(u2, u1) } }
    // uid-set = (uniqueid / uid-range) *("," uid-set)
    rule uid_set() -> Vec<Range>
      = (uid_range() / (u:uniqueid() { Range(u, u) })) ** ","

    // resp-text-code, restricted to the codes we react to. PERMANENTFLAGS
    // nested literals are intentionally not supported.
    rule resp_text_code() -> RespCode<'input>
      = "ALERT" { RespCode::Alert }
      / "TRYCREATE" { RespCode::TryCreate }
      / "READ-ONLY" { RespCode::ReadOnly }
      / "UIDVALIDITY" SP() n:nz_number() { RespCode::UidValidity(n) }
      / "UIDNEXT" SP() n:nz_number() { RespCode::UidNext(n) }
      / "APPENDUID" SP() v:nz_number() SP() u:uniqueid() { RespCode::AppendUid(v, u) }
      / "COPYUID" SP() v:nz_number() SP() f:uid_set() SP() t:uid_set() { RespCode::CopyUid(v, f, t) }
      / "PERMANENTFLAGS" SP() "(" fs:(flag_perm() ** SP()) ")" { RespCode::PermanentFlags(fs) }
      / c:capability_data() { RespCode::Capability(c) }
      / o:$((!"]" TEXT_CHAR())+) { RespCode::Other(o) }

    // resp-text = ["[" resp-text-code "]" SP] text
    rule resp_text() -> (Option<RespCode<'input>>, &'input [u8])
      = "[" c:resp_text_code() "]" t:((SP() t:text() { t }) / (&CR() { &b""[..] })) { (Some(c), t) }
      / t:text() { (None, t) }
      / &CR() { (None, &b""[..]) }

    // resp-cond-state = ("OK" / "NO" / "BAD") SP resp-text
    // resp-cond-auth = ("OK" / "PREAUTH") SP resp-text
    // resp-cond-bye = "BYE" SP resp-text
    rule cond() -> Cond
      = "OK" { Cond::Ok }
      / "NO" { Cond::No }
      / "BAD" { Cond::Bad }
      / "BYE" { Cond::Bye }
      / "PREAUTH" { Cond::Preauth }
    rule resp_cond() -> CondState<'input>
      = c:cond() SP() t:resp_text()
      { CondState { cond: c, code: t.0, text: t.1 } }

    // https://www.rfc-editor.org/rfc/rfc3501#section-2.2.2
    // Data transmitted by the server to the client and status responses that
    // do not indicate command completion are prefixed with the token "*".
    // Continuation requests are prefixed with "+".
    #[no_eof]
    pub rule start() -> (usize, &'input [u8])
      = s:($("*") / $("+") / tag()) SP() p:position!()
      { (p, s) }

    // A bare "+" continuation (some servers send no text after it).
    #[no_eof]
    pub rule bare_continuation() -> (usize, ())
      = "+" CRLF() p:position!()
      { (p, ()) }

    #[no_eof]
    pub rule tagged_result() -> (usize, CondState<'input>)
      = c:resp_cond() CRLF() p:position!()
      { (p, c) }

    // Discards one response of unknown shape, honoring trailing literals.
    rule junk() = ("{" n:number() "}" CRLF() ##skip(usize::try_from(n).unwrap())) / (!CRLF() [_])
    #[no_eof]
    pub rule skip() -> (usize, ())
      = junk()* CRLF() p:position!()
      { (p, ()) }

    // https://www.rfc-editor.org/rfc/rfc2342
    // Namespace = nil / "(" 1*( "(" string SP (DQUOTE QUOTED-CHAR DQUOTE / nil) *(...) ")" ) ")"
    // Only the first personal namespace is of interest.
    rule namespace_descr() -> (Vec<u8>, Option<u8>)
      = "(" p:string() SP() d:(DQUOTE() c:QUOTED_CHAR() DQUOTE() { Some(c) } / nil() { None }) junk_in_paren()* ")"
      { (p.into_owned(), d) }
    rule junk_in_paren() = quoted() {()} / (!")" !"\"" [_]) {()}
    rule namespace_item() -> Option<(Vec<u8>, Option<u8>)>
      = nil() { None }
      / "(" d:namespace_descr() descr_more()* ")" { Some(d) }
    rule descr_more() = namespace_descr() {()}

    // msg-att pieces, accepted in any order.
    rule msg_att() -> FetchAtt<'input>
      = "UID" SP() u:uniqueid() { FetchAtt::Uid(u) }
      / "FLAGS" SP() "(" fs:(flag_fetch() ** SP()) ")" { FetchAtt::Flags(fs) }
      / "INTERNALDATE" SP() d:quoted() { FetchAtt::InternalDate(d) }
      / "RFC822.SIZE" SP() n:number() { FetchAtt::Rfc822Size(n) }
      / "BODY[HEADER" (".FIELDS" SP() "(" (astring() ** SP()) ")" / "") "]" SP() s:nstring() { FetchAtt::Header(s) }
      / "BODY[]" SP() s:nstring() { FetchAtt::Body(s) }

    // response-data = "*" SP (resp-cond-state / resp-cond-bye / mailbox-data /
    //                 message-data / capability-data) CRLF
    #[no_eof]
    pub rule untagged() -> (usize, Untagged<'input>)
      = u:(
          c:capability_data() { Untagged::Capability(c) }
        / ("LIST" / "LSUB") SP() l:mailbox_list() { Untagged::List { flags: l.0, delimiter: l.1, mailbox: l.2 } }
        / "FLAGS" SP() "(" fs:(flag_fetch() ** SP()) ")" { Untagged::Flags(fs) }
        / "NAMESPACE" SP() p:namespace_item() junk()* { Untagged::Namespace(p) }
        / n:number() SP() s:(
            "EXISTS" { Untagged::Exists(n) }
          / "RECENT" { Untagged::Recent(n) }
          / "EXPUNGE" { Untagged::ExpungeSeq(n) }
          / "FETCH" SP() "(" a:(msg_att() ** SP()) ")" { Untagged::Fetch(n, a) }
          ) { s }
        / c:resp_cond() { Untagged::Cond(c) }
        ) CRLF() p:position!()
      { (p, u) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn start() {
    let (_, untagged) = response::start(b"* ").unwrap();
    assert_eq!(b"*", untagged);

    let (_, tag) = response::start(b"t42 ").unwrap();
    assert_eq!(b"t42", tag);

    let (_, continuation) = response::start(b"+ ").unwrap();
    assert_eq!(b"+", continuation);
  }

  #[test]
  fn tagged() {
    let (_, state) = response::tagged_result(b"OK [READ-ONLY] Select completed.\r\n").unwrap();
    assert_eq!(Cond::Ok, state.cond);
    assert_eq!(Some(RespCode::ReadOnly), state.code);

    let (_, state) = response::tagged_result(b"NO [TRYCREATE] no such mailbox\r\n").unwrap();
    assert_eq!(Cond::No, state.cond);
    assert_eq!(Some(RespCode::TryCreate), state.code);

    let (_, state) = response::tagged_result(b"OK [APPENDUID 1677851195 9] done\r\n").unwrap();
    assert_eq!(Some(RespCode::AppendUid(1677851195, 9)), state.code);

    let (_, state) = response::tagged_result(b"BAD go away\r\n").unwrap();
    assert_eq!(Cond::Bad, state.cond);
    assert_eq!(b"go away", state.text);
  }

  #[test]
  fn greeting() {
    let (_, untagged) =
      response::untagged(b"OK [CAPABILITY IMAP4rev1 AUTH=PLAIN LITERAL+] Dovecot ready.\r\n").unwrap();
    match untagged {
      Untagged::Cond(CondState { cond: Cond::Ok, code: Some(RespCode::Capability(c)), .. }) => {
        assert_eq!(vec![&b"IMAP4rev1"[..], b"AUTH=PLAIN", b"LITERAL+"], c);
      }
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn capability() {
    let (_, untagged) = response::untagged(b"CAPABILITY IMAP4rev1 UIDPLUS MOVE\r\n").unwrap();
    assert_eq!(
      Untagged::Capability(vec![&b"IMAP4rev1"[..], b"UIDPLUS", b"MOVE"]),
      untagged
    );
  }

  #[test]
  fn list() {
    let (_, untagged) = response::untagged(b"LIST (\\HasNoChildren) \"/\" \"quoted\"\r\n").unwrap();
    match untagged {
      Untagged::List { flags, delimiter, mailbox } => {
        assert_eq!(vec![&b"\\HasNoChildren"[..]], flags);
        assert_eq!(Some(b'/'), delimiter);
        assert_eq!(Mailbox::Other(borrow::Cow::Owned(b"quoted".to_vec())), mailbox);
      }
      other => panic!("{other:?}"),
    }

    let (_, untagged) = response::untagged(b"LIST () \".\" {7}\r\nliteral\r\n").unwrap();
    match untagged {
      Untagged::List { mailbox, .. } => {
        assert_eq!(Mailbox::Other(borrow::Cow::Borrowed(&b"literal"[..])), mailbox);
      }
      other => panic!("{other:?}"),
    }

    let (_, untagged) = response::untagged(b"LIST () NIL inbox\r\n").unwrap();
    match untagged {
      Untagged::List { delimiter, mailbox, .. } => {
        assert_eq!(None, delimiter);
        assert_eq!(Mailbox::Inbox, mailbox);
      }
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn select_responses() {
    let (_, untagged) = response::untagged(b"23 EXISTS\r\n").unwrap();
    assert_eq!(Untagged::Exists(23), untagged);

    let (_, untagged) = response::untagged(b"1 RECENT\r\n").unwrap();
    assert_eq!(Untagged::Recent(1), untagged);

    let (_, untagged) = response::untagged(b"OK [UIDVALIDITY 1676645821] UIDs valid\r\n").unwrap();
    match untagged {
      Untagged::Cond(CondState { code: Some(RespCode::UidValidity(1676645821)), .. }) => (),
      other => panic!("{other:?}"),
    }

    let (_, untagged) = response::untagged(b"OK [UIDNEXT 4392] Predicted next UID\r\n").unwrap();
    match untagged {
      Untagged::Cond(CondState { code: Some(RespCode::UidNext(4392)), .. }) => (),
      other => panic!("{other:?}"),
    }

    let (_, untagged) = response::untagged(
      b"OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)] ok\r\n",
    )
    .unwrap();
    match untagged {
      Untagged::Cond(CondState { code: Some(RespCode::PermanentFlags(fs)), .. }) => {
        assert_eq!(6, fs.len());
        assert!(fs.contains(&&b"\\*"[..]));
      }
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn expunge() {
    let (_, untagged) = response::untagged(b"3 EXPUNGE\r\n").unwrap();
    assert_eq!(Untagged::ExpungeSeq(3), untagged);
  }

  #[test]
  fn fetch() {
    let (_, untagged) =
      response::untagged(b"2 FETCH (UID 10 FLAGS (\\Seen $Forwarded) RFC822.SIZE 1234)\r\n").unwrap();
    match untagged {
      Untagged::Fetch(2, atts) => {
        assert_eq!(
          vec![
            FetchAtt::Uid(10),
            FetchAtt::Flags(vec![b"\\Seen", b"$Forwarded"]),
            FetchAtt::Rfc822Size(1234),
          ],
          atts
        );
      }
      other => panic!("{other:?}"),
    }

    // Attribute order is not fixed, and bodies arrive as literals.
    let (_, untagged) =
      response::untagged(b"1 FETCH (BODY[] {5}\r\nhello UID 7)\r\n").unwrap();
    match untagged {
      Untagged::Fetch(1, atts) => {
        assert_eq!(
          vec![
            FetchAtt::Body(Some(borrow::Cow::Borrowed(&b"hello"[..]))),
            FetchAtt::Uid(7),
          ],
          atts
        );
      }
      other => panic!("{other:?}"),
    }

    let (_, untagged) = response::untagged(
      b"1 FETCH (UID 7 BODY[HEADER.FIELDS (X-TUID MESSAGE-ID)] {17}\r\nX-TUID: abc\r\n\r\n\r\n)\r\n",
    )
    .unwrap();
    match untagged {
      Untagged::Fetch(1, atts) => {
        assert_eq!(FetchAtt::Uid(7), atts[0]);
        match &atts[1] {
          FetchAtt::Header(Some(h)) => assert_eq!(&b"X-TUID: abc\r\n\r\n\r\n"[..], &h[..]),
          other => panic!("{other:?}"),
        }
      }
      other => panic!("{other:?}"),
    }

    let (_, untagged) = response::untagged(b"9 FETCH (INTERNALDATE \"17-Jul-1996 02:44:25 -0700\" UID 3)\r\n").unwrap();
    match untagged {
      Untagged::Fetch(9, atts) => {
        assert_eq!(FetchAtt::InternalDate(b"17-Jul-1996 02:44:25 -0700".to_vec()), atts[0]);
      }
      other => panic!("{other:?}"),
    }
  }

  #[test]
  fn namespace() {
    let (_, untagged) =
      response::untagged(b"NAMESPACE ((\"INBOX.\" \".\")) NIL NIL\r\n").unwrap();
    assert_eq!(Untagged::Namespace(Some((b"INBOX.".to_vec(), Some(b'.')))), untagged);

    let (_, untagged) = response::untagged(b"NAMESPACE NIL NIL ((\"#shared/\" \"/\"))\r\n").unwrap();
    assert_eq!(Untagged::Namespace(None), untagged);
  }

  #[test]
  fn skip_unknown() {
    let (consumed, ()) = response::skip(b"STATUS blah (MESSAGES 231)\r\nleftover").unwrap();
    assert_eq!(b"STATUS blah (MESSAGES 231)\r\n".len(), consumed);

    // Unknown responses with literals are skipped in full.
    let (consumed, ()) = response::skip(b"X-ODD {4}\r\na\r\nb more\r\nrest").unwrap();
    assert_eq!(b"X-ODD {4}\r\na\r\nb more\r\n".len(), consumed);
  }
}
