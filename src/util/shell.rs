//! Quoting for command lines that pass through a remote shell, as ssh does with its arguments

/// Single-quotes `word` unless it only holds characters no POSIX shell treats specially
pub fn quote(word: &str) -> String {
	let plain = !word.is_empty()
		&& word
			.bytes()
			.all(|b| b.is_ascii_alphanumeric() || b"-_./:=@,+%".contains(&b));
	if plain {
		word.to_owned()
	} else {
		format!("'{}'", word.replace('\'', r"'\''"))
	}
}

pub fn join<I, S>(words: I) -> String
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	words
		.into_iter()
		.map(|w| quote(w.as_ref()))
		.collect::<Vec<_>>()
		.join(" ")
}

/// Splits a command template such as `ssh -o "ProxyCommand=ssh -W %h:%p jump"` into words the way
/// rsync splits `-e`/`RSYNC_RSH`: on whitespace, except inside single or double quotes, with
/// backslash escapes outside single quotes. An unterminated quote runs to the end.
pub fn split(template: &str) -> Vec<String> {
	let mut words = Vec::new();
	let mut word = String::new();
	// a word may be empty, like ""
	let mut in_word = false;
	let mut chars = template.chars();

	while let Some(c) = chars.next() {
		match c {
			c if c.is_whitespace() => {
				if in_word {
					words.push(std::mem::take(&mut word));
					in_word = false;
				}
			}
			'\'' => {
				in_word = true;
				word.extend(chars.by_ref().take_while(|&c| c != '\''));
			}
			'"' => {
				in_word = true;
				while let Some(c) = chars.next() {
					match c {
						'"' => break,
						'\\' => match chars.next() {
							Some(e @ ('"' | '\\')) => word.push(e),
							Some(e) => {
								word.push('\\');
								word.push(e);
							}
							None => word.push('\\'),
						},
						c => word.push(c),
					}
				}
			}
			'\\' => {
				in_word = true;
				if let Some(e) = chars.next() {
					word.push(e);
				}
			}
			c => {
				in_word = true;
				word.push(c);
			}
		}
	}
	if in_word {
		words.push(word);
	}
	words
}
