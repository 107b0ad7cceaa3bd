// Copyright 2026 Authors of skdispatch
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/*!
Procedural macros to help writing `sk_lookup` programs using the
`skdispatch-probes` crate.

# Overview

The macros only place items in the ELF sections the `skdispatch` loader
looks for:

 * `license` for the program license
 * `version` for the kernel version code
 * `maps/<name>` for map definitions
 * `sk_lookup/<name>` for socket lookup programs

# Example

```ignore
#![no_std]
#![no_main]
use skdispatch_probes::sk_lookup::prelude::*;

program!(0xFFFFFFFE, "Dual BSD/GPL");

#[map]
static mut ports: HashMap<u16, u8> = HashMap::with_max_entries(1024);

#[sk_lookup]
pub fn pass_all(ctx: SkLookupContext) -> Verdict {
    Verdict::Pass
}
```
*/
extern crate proc_macro;
use proc_macro::TokenStream;
use proc_macro2::{Ident, Span, TokenStream as TokenStream2};
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::token::Comma;
use syn::{parse_macro_input, Expr, ExprLit, ItemFn, ItemStatic, Lit, Result};

fn inline_string_literal(e: &Expr) -> (TokenStream2, TokenStream2) {
    let mut bytes = match e {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => s.value().into_bytes(),
        _ => panic!("expected string literal"),
    };
    bytes.push(0u8);
    let len = bytes.len();
    let ty = quote!([u8; #len]);
    let array_lit = quote!([#(#bytes),*]);

    (ty, array_lit)
}

fn section_name(ty: &str, attrs: TokenStream, default: &Ident) -> String {
    if attrs.is_empty() {
        return format!("{}/{}", ty, default);
    }

    let attrs: TokenStream2 = attrs.into();
    match syn::parse2::<Expr>(attrs) {
        Ok(Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        })) => format!("{}/{}", ty, s.value()),
        _ => panic!("expected string literal"),
    }
}

struct Args(Punctuated<Expr, Comma>);

impl Parse for Args {
    fn parse(input: ParseStream) -> Result<Args> {
        Ok(Args(Punctuated::parse_terminated(input)?))
    }
}

/// Generates program metadata.
///
/// Takes two arguments, the `LINUX_VERSION_CODE` the program is compatible with,
/// and the license. The special version code `0xFFFFFFFE` can be used to signify
/// any kernel version.
///
/// Also emits the panic handler every `no_std` program needs. The verifier
/// rejects programs that can reach it, so it is never called at runtime.
///
/// #Example
///
/// ```ignore
/// program!(0xFFFFFFFE, "Dual BSD/GPL");
/// ```
///
#[proc_macro]
pub fn program(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as Args);
    let mut args = input.0.iter();
    let version = args.next().expect("no version");
    let license = args.next().expect("no license");
    let (license_ty, license) = inline_string_literal(license);
    let tokens = quote! {
        #[no_mangle]
        #[link_section = "license"]
        pub static _license: #license_ty = #license;

        #[no_mangle]
        #[link_section = "version"]
        pub static _version: u32 = #version;

        #[panic_handler]
        #[no_mangle]
        pub extern "C" fn rust_begin_panic(_info: &::core::panic::PanicInfo) -> ! {
            unsafe { ::core::hint::unreachable_unchecked() }
        }
    };

    tokens.into()
}

/// Attribute macro that must be used when creating maps.
///
/// The map is named after the static unless a name is given.
///
/// # Example
/// ```ignore
/// #[map]
/// static mut echo_ports: HashMap<u16, u8> = HashMap::with_max_entries(1024);
///
/// #[map("echo_socket")]
/// static mut socket: SockMap = SockMap::with_max_entries(1);
/// ```
#[proc_macro_attribute]
pub fn map(attrs: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemStatic);
    let section_name = section_name("maps", attrs, &item.ident);
    let tokens = quote! {
        #[no_mangle]
        #[link_section = #section_name]
        #item
    };

    tokens.into()
}

/// Attribute macro that must be used to define `sk_lookup` programs.
///
/// The annotated function takes a
/// [`SkLookupContext`](../skdispatch_probes/sk_lookup/struct.SkLookupContext.html)
/// and returns a `Verdict`. The macro wraps it in the `extern "C"` entry point
/// the kernel calls with the raw `bpf_sk_lookup` pointer.
///
/// # Example
/// ```ignore
/// #[sk_lookup("echo_dispatch")]
/// pub fn dispatcher(mut ctx: SkLookupContext) -> Verdict {
///     ...
/// }
/// ```
#[proc_macro_attribute]
pub fn sk_lookup(attrs: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    let ident = item.sig.ident.clone();
    let vis = item.vis.clone();
    let section_name = section_name("sk_lookup", attrs, &ident);
    let raw_ctx = Ident::new("_raw_ctx", Span::call_site());
    let tokens = quote! {
        #[no_mangle]
        #[link_section = #section_name]
        #vis extern "C" fn #ident(#raw_ctx: *mut ::skdispatch_probes::bindings::bpf_sk_lookup) -> u32 {
            #[inline(always)]
            #item

            let ctx = ::skdispatch_probes::sk_lookup::SkLookupContext::new(#raw_ctx);
            #ident(ctx).into()
        }
    };

    tokens.into()
}
