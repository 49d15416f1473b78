use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const WORKER_THREADS: usize = 2;

/// Runs an `async fn` test on a multi-threaded Tokio runtime and fails it if
/// it has not finished after the given number of seconds (default 30).
///
/// The relay's upstream read loops and the downstream socket task run
/// concurrently, so the runtime always has more than one worker.
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(10)]
/// async fn session_closes() { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into()
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let test_name = sig.ident.to_string();
    let workers = WORKER_THREADS;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#timeout_secs);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#workers)
                .thread_name(#test_name)
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            let outcome = runtime.block_on(async move {
                tokio::time::timeout(budget, async move #block).await
            });
            runtime.shutdown_timeout(std::time::Duration::from_secs(1));
            if outcome.is_err() {
                panic!("{} timed out after {:?}", #test_name, budget);
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
