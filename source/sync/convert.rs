// Message conversion on the copy path: line-ending translation between
// stores, injection of the X-TUID header right before the first empty line
// (creating that break when the source has no complete header section), and
// placeholder generation for messages over the size limit.

use crate::driver::{Flags, Tuid};

const SUBJECT_PREFIX: &str = "[placeholder] ";
const MISSING_SUBJECT: &str = "Subject: [placeholder] (No Subject)";

fn starts_with_fold(buf: &[u8], prefix: &[u8]) -> bool {
  buf.len() >= prefix.len() && buf[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Copies a byte range, translating line endings when source and target
/// conventions differ. A lone CR is not a line ending and passes through.
fn copy_bytes(out: &mut Vec<u8>, input: &[u8], from: usize, to: usize, in_cr: bool, out_cr: bool) {
  let slice = &input[from..to];
  if in_cr == out_cr {
    out.extend_from_slice(slice);
    return;
  }
  let mut pc = 0u8;
  if out_cr {
    for &c in slice {
      if c == b'\n' && pc != b'\r' {
        out.push(b'\r');
      }
      out.push(c);
      pc = c;
    }
  } else {
    for &c in slice {
      if c == b'\n' && pc == b'\r' {
        out.pop();
      }
      out.push(c);
      pc = c;
    }
  }
}

fn size_string(size: u32) -> String {
  if size < 1024000 {
    format!("{}KiB", size >> 10)
  } else {
    format!("{:.1}MiB", size as f64 / 1048576.0)
  }
}

/// Converts a message for storage on the other side.
///
/// `in_cr`/`out_cr` say whether the source and target stores use CRLF line
/// endings. With `tuid` set, an `X-TUID:` header replaces any existing one at
/// the end of the headers. `minimal` replaces the body with a placeholder
/// notice quoting `full_size`; the Flagged bit is dropped from `flags` in
/// that case so the copy is not mistaken for an upgrade request later.
pub fn convert_msg(
  input: &[u8],
  in_cr: bool,
  out_cr: bool,
  tuid: Option<Tuid>,
  minimal: bool,
  full_size: u32,
  flags: &mut Flags,
) -> Result<Vec<u8>, &'static str> {
  let mut in_len = input.len();
  let mut idx = 0;
  // Insert/removal range for the X-TUID header.
  let mut sbreak = 0;
  let mut ebreak = 0;
  let mut have_break = false;
  // Insert position for the placeholder subject.
  let mut break2: Option<usize> = None;
  let mut add_subj = false;
  let mut fix_subj = false;
  let mut fix_tuid = false;
  let mut fix_hdr = false;
  let mut end_hdr = false;
  let mut hdr_crs = 0usize;
  let mut lines = 0usize;

  if tuid.is_some() {
    loop {
      let mut start = idx;
      let mut line_cr = 0usize;
      let mut got_line = false;
      let mut pc = 0u8;
      while idx < in_len {
        let c = input[idx];
        idx += 1;
        if c == b'\n' {
          if pc == b'\r' {
            line_cr = 1;
          }
          got_line = true;
          break;
        }
        pc = c;
      }
      if !have_break && starts_with_fold(&input[start..], b"X-TUID: ") {
        sbreak = start;
        ebreak = idx;
        have_break = true;
        if !minimal {
          break;
        }
        continue;
      }
      if break2.is_none() && minimal && starts_with_fold(&input[start..], b"SUBJECT:") {
        let mut b2 = start + 8;
        if b2 < in_len && input[b2] == b' ' {
          b2 += 1;
        }
        break2 = Some(b2);
      }
      hdr_crs += line_cr;
      if got_line {
        lines += 1;
        if idx - line_cr - 1 != start {
          continue;
        }
        // Empty line: end of headers.
      } else {
        // The final line is incomplete.
        if pc == b'\r' {
          idx -= 1;
        }
        if idx != start {
          // Schedule completing it, and put our headers after it; it might
          // be a continuation, so prepending would tear a folded header.
          fix_hdr = true;
          start = idx;
        }
        end_hdr = true;
      }
      if !have_break {
        sbreak = start;
        ebreak = start;
        have_break = true;
        fix_tuid = fix_hdr;
        fix_hdr = false;
      }
      if minimal {
        in_len = idx;
        if break2.is_none() {
          break2 = Some(start);
          add_subj = true;
          fix_subj = fix_hdr;
          fix_hdr = false;
        }
      } else {
        end_hdr = false;
      }
      break;
    }
  }

  let app_cr = out_cr && (!in_cr || hdr_crs > 0 || lines == 0);
  let nl: &[u8] = if app_cr { b"\r\n" } else { b"\n" };

  let mut out = Vec::with_capacity(in_len + 256);
  let mut idx = 0;
  if let Some(tuid) = tuid {
    if let Some(b2) = break2 {
      if b2 < sbreak {
        copy_bytes(&mut out, input, idx, b2, in_cr, out_cr);
        out.extend_from_slice(SUBJECT_PREFIX.as_bytes());
        idx = b2;
      }
    }
    copy_bytes(&mut out, input, idx, sbreak, in_cr, out_cr);
    if fix_tuid {
      out.extend_from_slice(nl);
    }
    out.extend_from_slice(b"X-TUID: ");
    out.extend_from_slice(&tuid.0);
    out.extend_from_slice(nl);
    idx = ebreak;
    if let Some(b2) = break2 {
      if b2 >= sbreak {
        copy_bytes(&mut out, input, idx, b2, in_cr, out_cr);
        if !add_subj {
          out.extend_from_slice(SUBJECT_PREFIX.as_bytes());
        } else {
          if fix_subj {
            out.extend_from_slice(nl);
          }
          out.extend_from_slice(MISSING_SUBJECT.as_bytes());
          out.extend_from_slice(nl);
        }
        idx = b2;
      }
    }
  }
  copy_bytes(&mut out, input, idx, in_len, in_cr, out_cr);

  if minimal {
    if end_hdr {
      if fix_hdr {
        out.extend_from_slice(nl);
      }
      out.extend_from_slice(nl);
    }
    out.extend_from_slice(
      format!(
        "Having a size of {}, this message is over the MaxSize limit.{}\
         Flag it and sync again (Sync mode Upgrade) to fetch its real contents.{}",
        size_string(full_size),
        String::from_utf8_lossy(nl),
        String::from_utf8_lossy(nl),
      )
      .as_bytes(),
    );
    if flags.contains(Flags::FLAGGED) {
      *flags = *flags - Flags::FLAGGED;
      out.extend_from_slice(
        format!(
          "{}The original message is flagged as important.{}",
          String::from_utf8_lossy(nl),
          String::from_utf8_lossy(nl),
        )
        .as_bytes(),
      );
    }
  }

  if out.len() > i32::MAX as usize {
    return Err("is too big after conversion");
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  const TUID: &str = "one two tuid";

  fn tuid() -> Tuid {
    TUID.parse().unwrap()
  }

  fn strip_cr(buf: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pc = 0u8;
    for &c in buf.as_bytes() {
      if c == b'\n' && pc == b'\r' {
        out.pop();
      }
      out.push(c);
      pc = c;
    }
    out
  }

  const BIG_SIZE: u32 = 2345687; // prints as 2.2MiB

  fn check(
    name: &str,
    input: &str,
    expected: &str,
    add_tuid: bool,
    minimal: bool,
    flagged: bool,
  ) {
    // The same grid of line-ending combinations the converter meets in the
    // wild: LF source to CRLF-capable target, CRLF to LF, and same-to-same
    // (which only happens when a TUID is added).
    let mut cases: Vec<(bool, bool, Vec<u8>, Vec<u8>)> = vec![
      (false, true, strip_cr(input), expected.as_bytes().to_vec()),
      (true, false, expected_in(input), strip_cr(expected)),
    ];
    if add_tuid {
      cases.push((false, false, strip_cr(input), strip_cr(expected)));
      cases.push((true, true, expected_in(input), expected.as_bytes().to_vec()));
    }
    for (in_cr, out_cr, input, expected) in cases {
      let mut flags = if flagged { Flags::FLAGGED } else { Flags::NONE };
      let out = convert_msg(
        &input,
        in_cr,
        out_cr,
        add_tuid.then(tuid),
        minimal,
        BIG_SIZE,
        &mut flags,
      )
      .unwrap();
      assert_eq!(
        String::from_utf8_lossy(&expected),
        String::from_utf8_lossy(&out),
        "{name} (in_cr={in_cr} out_cr={out_cr})"
      );
      if minimal {
        assert!(!flags.contains(Flags::FLAGGED));
      }
    }

    fn expected_in(input: &str) -> Vec<u8> {
      input.as_bytes().to_vec()
    }
  }

  const FROM: &str = "From: de\rvil\r\n";
  const TO: &str = "To: me\r\n";
  const IN_TUID: &str = "X-TUID: garbage\r\n";
  const OUT_TUID: &str = "X-TUID: one two tuid\r\n";
  const SUBJECT: &str = "Subject: hell\r\n";
  const PH_SUBJECT: &str = "Subject: [placeholder] hell\r\n";
  const NO_SUBJECT: &str = "Subject: [placeholder] (No Subject)\r\n";
  const BODY: &str = "\r\nHi,\r\n\r\n...\r\n";
  const PH_BODY: &str = "\r\nHaving a size of 2.2MiB, this message is over the MaxSize limit.\r\n\
    Flag it and sync again (Sync mode Upgrade) to fetch its real contents.\r\n";

  #[test]
  fn passthrough() {
    let input = format!("{FROM}{TO}{BODY}");
    check("from / to", &input, &input, false, false, false);
  }

  #[test]
  fn adds_tuid() {
    let input = format!("{FROM}{TO}{BODY}");
    let output = format!("{FROM}{TO}{OUT_TUID}{BODY}");
    check("from / to", &input, &output, true, false, false);
  }

  #[test]
  fn replaces_tuid() {
    let input = format!("{FROM}{IN_TUID}{TO}{BODY}");
    let output = format!("{FROM}{OUT_TUID}{TO}{BODY}");
    check("from / tuid / to", &input, &output, true, false, false);
  }

  #[test]
  fn placeholder_without_subject() {
    let input = format!("{FROM}{TO}{BODY}");
    let output = format!("{FROM}{TO}{OUT_TUID}{NO_SUBJECT}{PH_BODY}");
    check("from / to", &input, &output, true, true, false);
  }

  #[test]
  fn placeholder_flagged() {
    let input = format!("{FROM}{TO}{BODY}");
    let flagged_body = format!("{PH_BODY}\r\nThe original message is flagged as important.\r\n");
    let output = format!("{FROM}{TO}{OUT_TUID}{NO_SUBJECT}{flagged_body}");
    check("from / to", &input, &output, true, true, true);
  }

  #[test]
  fn placeholder_drops_stale_tuid() {
    let input = format!("{FROM}{IN_TUID}{TO}{BODY}");
    let output = format!("{FROM}{OUT_TUID}{TO}{NO_SUBJECT}{PH_BODY}");
    check("from / tuid / to", &input, &output, true, true, false);
  }

  #[test]
  fn placeholder_prefixes_subject() {
    let input = format!("{FROM}{SUBJECT}{TO}{BODY}");
    let output = format!("{FROM}{PH_SUBJECT}{TO}{OUT_TUID}{PH_BODY}");
    check("from / subject / to", &input, &output, true, true, false);

    let input = format!("{FROM}{SUBJECT}{IN_TUID}{TO}{BODY}");
    let output = format!("{FROM}{PH_SUBJECT}{OUT_TUID}{TO}{PH_BODY}");
    check("from / subject / tuid / to", &input, &output, true, true, false);

    let input = format!("{SUBJECT}{FROM}{IN_TUID}{TO}{BODY}");
    let output = format!("{PH_SUBJECT}{FROM}{OUT_TUID}{TO}{PH_BODY}");
    check("subject / from / tuid / to", &input, &output, true, true, false);

    let input = format!("{FROM}{IN_TUID}{SUBJECT}{TO}{BODY}");
    let output = format!("{FROM}{OUT_TUID}{PH_SUBJECT}{TO}{PH_BODY}");
    check("from / tuid / subject / to", &input, &output, true, true, false);

    let input = format!("{IN_TUID}{FROM}{SUBJECT}{TO}{BODY}");
    let output = format!("{OUT_TUID}{FROM}{PH_SUBJECT}{TO}{PH_BODY}");
    check("tuid / from / subject / to", &input, &output, true, true, false);
  }

  #[test]
  fn incomplete_headers() {
    // No header/body break at all: the break is created.
    let mut flags = Flags::NONE;
    let out =
      convert_msg(b"From: a\n", false, false, Some(tuid()), false, 0, &mut flags).unwrap();
    assert_eq!(&b"From: a\nX-TUID: one two tuid\n"[..], &out[..]);

    // Unterminated header line: it is completed first.
    let out =
      convert_msg(b"From: a", false, false, Some(tuid()), false, 0, &mut flags).unwrap();
    assert_eq!(&b"From: a\nX-TUID: one two tuid\n"[..], &out[..]);

    // Empty message.
    let out = convert_msg(b"", false, false, Some(tuid()), false, 0, &mut flags).unwrap();
    assert_eq!(&b"X-TUID: one two tuid\n"[..], &out[..]);
  }

  #[test]
  fn line_ending_conversion() {
    let mut flags = Flags::NONE;
    // convert(CRLF, LF, m) has no \r before \n.
    let out = convert_msg(b"a\r\nb\r\n\r\nc\r\n", true, false, None, false, 0, &mut flags).unwrap();
    assert_eq!(&b"a\nb\n\nc\n"[..], &out[..]);
    // strip_CR(convert(LF, CRLF, m)) == strip_CR(m).
    let out = convert_msg(b"a\nb\n\nc\n", false, true, None, false, 0, &mut flags).unwrap();
    assert_eq!(&b"a\r\nb\r\n\r\nc\r\n"[..], &out[..]);
    // A lone CR is data, not a line ending.
    let out = convert_msg(b"de\rvil\n", false, true, None, false, 0, &mut flags).unwrap();
    assert_eq!(&b"de\rvil\r\n"[..], &out[..]);
  }

  #[test]
  fn size_strings() {
    assert_eq!("0KiB", size_string(100));
    assert_eq!("50KiB", size_string(50 * 1024));
    assert_eq!("2.2MiB", size_string(BIG_SIZE));
  }
}
