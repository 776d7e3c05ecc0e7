use proc_macro::{TokenStream, TokenTree};

/// Splits a `TokenStream` into comma-separated arguments.
///
/// Each argument is returned as a `Vec<TokenTree>`.
/// Commas at the top level are used as separators.
pub(crate) fn split_args(input: TokenStream) -> Vec<Vec<TokenTree>> {
    let mut args = Vec::new();
    let mut current = Vec::new();

    for token in input {
        match &token {
            TokenTree::Punct(p) if p.as_char() == ',' => {
                if !current.is_empty() {
                    args.push(current);
                    current = Vec::new();
                }
            }
            _ => current.push(token),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Parses `key = value` pairs from an attribute's arguments.
///
/// Entries without `=` are returned with an empty value.
pub(crate) fn parse_options(attr: TokenStream) -> Vec<(String, String)> {
    split_args(attr)
        .into_iter()
        .map(|tokens| {
            let text = tokens.iter().map(|t| t.to_string()).collect::<String>();
            match text.split_once('=') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (text.trim().to_string(), String::new()),
            }
        })
        .collect()
}

/// Builder chain configuring the environment from the attribute options.
///
/// Unknown keys become a `compile_error!` naming them.
pub(crate) fn environment_builder(options: &[(String, String)]) -> String {
    let mut builder = String::from("::skiff::Environment::builder()");

    for (key, value) in options {
        match key.as_str() {
            "async_threads" | "async_queue" => match value.parse::<usize>() {
                Ok(n) => builder.push_str(&format!(".{key}({n})")),
                Err(_) => return compile_error(&format!("{key} expects an integer, got `{value}`")),
            },
            "executable_name" | "default_version" => builder.push_str(&format!(".{key}({value})")),
            _ => return compile_error(&format!("unknown option `{key}`")),
        }
    }

    builder.push_str(".build()");
    builder
}

/// The name of the function declared by `tokens`.
pub(crate) fn fn_name(tokens: &[TokenTree]) -> Option<String> {
    let pos = tokens
        .iter()
        .position(|t| matches!(t, TokenTree::Ident(id) if id.to_string() == "fn"))?;

    match tokens.get(pos + 1) {
        Some(TokenTree::Ident(name)) => Some(name.to_string()),
        _ => None,
    }
}

pub(crate) fn compile_error(message: &str) -> String {
    format!("::core::compile_error!({message:?})")
}
