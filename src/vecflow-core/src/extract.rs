use regex::Regex;

/// Extractor turns raw markup into plain text
pub trait Extractor: Send + Sync {
    fn extract(&self, raw: &str) -> String;
}

/// HTML extractor: drops script and style blocks and all tags, decodes the
/// common entities, and emits one line per non-empty text node.
pub struct HtmlExtractor {
    hidden: Regex,
    tag: Regex,
}

impl HtmlExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            hidden: Regex::new(
                r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->",
            )?,
            tag: Regex::new(r"(?s)<[^>]*>")?,
        })
    }
}

impl Extractor for HtmlExtractor {
    fn extract(&self, raw: &str) -> String {
        let visible = self.hidden.replace_all(raw, " ");

        self.tag
            .split(&visible)
            .map(|node| decode_entities(node.trim()))
            .filter(|node| !node.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        let decoded = tail.find(';').and_then(|end| {
            let name = &tail[1..end];
            let ch = match name {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some(' '),
                _ => name
                    .strip_prefix("#x")
                    .or_else(|| name.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| name.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, end))
        });

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}
