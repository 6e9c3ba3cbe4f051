use proc_macro::TokenStream;
use quote::quote;
use syn::{FnArg, ItemFn, Pat, ReturnType, parse_macro_input};

/// Logs entry and exit of a control surface at debug level.
///
/// Every named argument except the caller context `cx` is printed with
/// `{:?}` on entry, and the `LinuxResult` is printed on exit:
///
/// ```text
/// [syscall] <= sys_setpgid(pid = 0, pgid = 7)
/// [syscall] => sys_setpgid(pid = 0, pgid = 7) = Ok(0)
/// ```
#[proc_macro_attribute]
pub fn syscall_trace(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut function = parse_macro_input!(item as ItemFn);
    let fn_name = &function.sig.ident;
    let arg_names: Vec<_> = function
        .sig
        .inputs
        .iter()
        .filter_map(|arg| match arg {
            FnArg::Typed(pat_type) => match &*pat_type.pat {
                Pat::Ident(pat_ident) if pat_ident.ident != "cx" => Some(pat_ident.ident.clone()),
                _ => None,
            },
            FnArg::Receiver(_) => None,
        })
        .collect();

    let arg_list_pattern = arg_names
        .iter()
        .map(|name| format!("{} = {{:?}}", name))
        .collect::<Vec<_>>()
        .join(", ");
    let format_pattern_in = format!("[syscall] <= {}({})", fn_name, arg_list_pattern);
    let format_pattern_out = format!("[syscall] => {}({}) = {{:?}}", fn_name, arg_list_pattern);

    let fn_body = &function.block;
    let ret_type = match &function.sig.output {
        ReturnType::Type(_, ty) => quote! { #ty },
        ReturnType::Default => quote! { () },
    };
    let block = quote! {{
        debug!(#format_pattern_in #(, #arg_names)*);
        let __result: #ret_type = (|| #fn_body)();
        debug!(#format_pattern_out #(, #arg_names)*, __result);
        __result
    }};
    function.block = match syn::parse2(block) {
        Ok(block) => block,
        Err(error) => return error.to_compile_error().into(),
    };
    quote! {
        #function
    }
    .into()
}
