mod utils;

use proc_macro::{TokenStream, TokenTree};

/// Wraps the expanded source, or reports why it does not parse.
fn finish(source: String, macro_name: &str) -> TokenStream {
    source.parse().unwrap_or_else(|err| {
        utils::compile_error(&format!("{macro_name} macro error: {err}"))
            .parse()
            .unwrap_or_default()
    })
}

/// Runs `fn main(lp: &mut EventLoop) -> ScriptResult` as the script of a
/// session and exits the process with its exit code.
///
/// The command-line arguments become the session's script arguments.
///
/// ```rust,ignore
/// #[skiff::main(async_threads = 8)]
/// fn main(lp: &mut EventLoop) -> ScriptResult {
///     lp.set_timeout(Duration::from_millis(10), |_| Ok(()));
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let tokens: Vec<TokenTree> = item.into_iter().collect();
    let options = utils::parse_options(attr);

    let Some(name) = utils::fn_name(&tokens) else {
        return finish(utils::compile_error("#[skiff::main] expects a function"), "main");
    };

    let script: TokenStream = tokens.into_iter().collect();
    let builder = utils::environment_builder(&options);

    let expanded = format!(
        "fn {name}() {{
            {script}

            let __env = {builder};
            let __args: ::std::vec::Vec<::std::string::String> = ::std::env::args().skip(1).collect();
            let __status = match __env.create_session_with({name}).with_args(__args).run() {{
                ::core::result::Result::Ok(status) => status,
                ::core::result::Result::Err(err) => {{
                    ::std::eprintln!(\"{{}}\", err);
                    ::std::process::exit(1);
                }}
            }};

            if let ::core::option::Option::Some(err) = __status.error() {{
                ::std::eprintln!(\"{{}}\", err);
            }}
            ::std::process::exit(__status.exit_code());
        }}"
    );

    finish(expanded, "main")
}

/// Runs `fn name(lp: &mut EventLoop) -> ScriptResult` as a test script in
/// a fresh environment and asserts it exits with code zero.
///
/// ```rust,ignore
/// #[skiff::test]
/// fn ticks_run_first(lp: &mut EventLoop) -> ScriptResult {
///     lp.next_tick(|_| Ok(()));
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let tokens: Vec<TokenTree> = item.into_iter().collect();
    let options = utils::parse_options(attr);

    let Some(name) = utils::fn_name(&tokens) else {
        return finish(utils::compile_error("#[skiff::test] expects a function"), "test");
    };

    let script: TokenStream = tokens.into_iter().collect();
    let builder = utils::environment_builder(&options);

    let expanded = format!(
        "#[test]
        fn {name}() {{
            {script}

            let __env = {builder};
            let __status = __env.run({name});
            assert!(__status.is_success(), \"script ended with {{}}\", __status);
        }}"
    );

    finish(expanded, "test")
}
