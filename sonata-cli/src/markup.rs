//! Inline command markup for `speak`: plain text with `[[command arg]]` tags.
//!
//! `[[pause 300]]` break in ms, `[[index 3]]` marker, `[[rate 80]]`,
//! `[[volume 60]]`, `[[pitch 40]]`, `[[lang de-DE]]` / `[[lang default]]`.

use anyhow::{bail, Context, Result};
use sonata_core::Directive;

const OPEN: &str = "[[";
const CLOSE: &str = "]]";

pub fn parse(input: &str) -> Result<Vec<Directive>> {
    let mut out = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            out.push(Directive::text(&rest[..start]));
        }
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .with_context(|| format!("unterminated command at {:?}", &rest[start..]))?;
        out.push(command(after[..end].trim())?);
        rest = &after[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        out.push(Directive::text(rest));
    }
    Ok(out)
}

fn command(tag: &str) -> Result<Directive> {
    let (name, arg) = tag.split_once(char::is_whitespace).unwrap_or((tag, ""));
    let arg = arg.trim();
    let number = |what: &str| -> Result<u32> {
        arg.parse::<u32>()
            .with_context(|| format!("[[{what}]] needs a number, got {arg:?}"))
    };
    let percent = |what: &str| -> Result<u8> {
        let n = number(what)?;
        if n > 100 {
            bail!("[[{what}]] takes 0..=100, got {n}");
        }
        Ok(n as u8)
    };
    Ok(match name {
        "pause" => Directive::Break { ms: number(name)? },
        "index" => Directive::Index(
            arg.parse()
                .with_context(|| format!("[[index]] needs an integer, got {arg:?}"))?,
        ),
        "rate" => Directive::Rate(percent(name)?),
        "volume" => Directive::Volume(percent(name)?),
        "pitch" => Directive::Pitch(percent(name)?),
        "lang" => match arg {
            "" => bail!("[[lang]] needs a language code or \"default\""),
            "default" => Directive::Language(None),
            code => Directive::Language(Some(code.to_string())),
        },
        other => bail!("unknown command [[{other}]]"),
    })
}
