// https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3 - Mailbox International Naming Convention
//
// Mailbox names cross the wire in the IMAP variant of UTF-7: base64 runs are
// delimited by "&" and "-", use "," instead of "/", and "&" itself is the
// two-octet sequence "&-". Both directions validate strictly; a name that
// does not survive the round trip is rejected rather than mangled.

use base64::Engine as _;

static ENGINE: once_cell::sync::Lazy<base64::engine::GeneralPurpose> =
  once_cell::sync::Lazy::new(|| {
    base64::engine::GeneralPurpose::new(
      &base64::alphabet::IMAP_MUTF7,
      base64::engine::general_purpose::NO_PAD,
    )
  });

pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  let engine = &*ENGINE;
  let mut buffer = Vec::new();
  let mut output = String::new();
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      b'&' => {
        let start = i;
        loop {
          i += 1;
          if i == input.len() {
            // Unterminated shift sequence.
            return None;
          }
          if input[i] == b'-' {
            break;
          }
        }
        if start + 1 == i {
          output.push('&');
        } else {
          // https://www.rfc-editor.org/rfc/rfc2152
          // Unicode is encoded using Modified Base64 by first converting Unicode
          // 16-bit quantities to an octet stream (with the most significant
          // octet first).
          buffer.truncate(0);
          buffer
            .try_reserve(base64::decoded_len_estimate(i - (start + 1)))
            .ok()?;
          engine.decode_vec(&input[start + 1..i], &mut buffer).ok()?;
          if buffer.len() % 2 != 0 {
            // Incomplete code point.
            return None;
          }

          let mut decoder = encoding_rs::UTF_16BE.new_decoder_without_bom_handling();
          output
            .try_reserve(decoder.max_utf8_buffer_length_without_replacement(buffer.len())?)
            .ok()?;
          let (result, _) = decoder.decode_to_string_without_replacement(
            &buffer,
            &mut output,
            true, // last; rejects isolated surrogates
          );
          match result {
            encoding_rs::DecoderResult::InputEmpty => (),
            _ => return None,
          }
        }
      }
      // Printable US-ASCII characters, except for "&", represent themselves;
      // that is, characters with octet values 0x20-0x25 and 0x27-0x7e.
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => output.push(c as char),
      _ => return None,
    }
    i += 1;
  }
  Some(output)
}

fn needs_encoding(c: char) -> bool {
  !matches!(c, '\x20'..='\x7e')
}

pub fn utf8_to_utf7(input: &str) -> String {
  let engine = &*ENGINE;
  let mut output = String::new();
  let mut run = Vec::new();
  let mut chars = input.chars().peekable();
  while let Some(&c) = chars.peek() {
    if needs_encoding(c) {
      run.truncate(0);
      while let Some(&c) = chars.peek() {
        if !needs_encoding(c) {
          break;
        }
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
          run.extend_from_slice(&unit.to_be_bytes());
        }
        chars.next();
      }
      output.push('&');
      output += &engine.encode(&run);
      output.push('-');
    } else {
      chars.next();
      output.push(c);
      if c == '&' {
        output.push('-');
      }
    }
  }
  output
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decode() {
    // https://www.rfc-editor.org/rfc/rfc3501#section-5.1.3
    assert_eq!("", utf7_to_utf8(b"").unwrap());
    assert_eq!("&", utf7_to_utf8(b"&-").unwrap());
    // [...] a mailbox name which mixes English, Chinese, and Japanese text:
    assert_eq!(
      "~peter/mail/台北/日本語",
      utf7_to_utf8(b"~peter/mail/&U,BTFw-/&ZeVnLIqe-").unwrap()
    );
    // [...] the string "&Jjo!" is not a valid mailbox name because it does not
    // contain a shift to US-ASCII before the "!".
    assert_eq!(None, utf7_to_utf8(b"&Jjo!"));
    // The correct form is "&Jjo-!".
    assert_eq!("☺!", utf7_to_utf8(b"&Jjo-!").unwrap());
  }

  #[test]
  fn decode_rejects_malformed() {
    // 8-bit octet inside a shift sequence.
    assert_eq!(None, utf7_to_utf8(b"&\xc3\xa9-"));
    // 8-bit octet outside a shift sequence.
    assert_eq!(None, utf7_to_utf8(b"caf\xc3\xa9"));
    // Control character.
    assert_eq!(None, utf7_to_utf8(b"a\x07b"));
    // Unterminated shift sequence.
    assert_eq!(None, utf7_to_utf8(b"&Jjo"));
    // Isolated high surrogate (D800 alone).
    assert_eq!(None, utf7_to_utf8(b"&2AA-"));
    // Incomplete code point (odd number of UTF-16 octets).
    assert_eq!(None, utf7_to_utf8(b"&JjoA-"));
  }

  #[test]
  fn encode() {
    assert_eq!("", utf8_to_utf7(""));
    assert_eq!("&-", utf8_to_utf7("&"));
    assert_eq!("&Jjo-!", utf8_to_utf7("☺!"));
    assert_eq!("~peter/mail/&U,BTFw-/&ZeVnLIqe-", utf8_to_utf7("~peter/mail/台北/日本語"));
    // Adjacent encoded characters share one shift sequence.
    assert_eq!("&ZeVnLIqe-", utf8_to_utf7("日本語"));
    // Code points above the BMP become surrogate pairs.
    assert_eq!("&2D3cqA-", utf8_to_utf7("\u{1f4a8}"));
  }

  #[test]
  fn round_trip() {
    for name in ["INBOX", "Entwürfe", "résumé & notes", "日本語/台北", "a\u{10000}b"] {
      let encoded = utf8_to_utf7(name);
      assert_eq!(name, utf7_to_utf8(encoded.as_bytes()).unwrap(), "via {encoded}");
    }
  }
}
