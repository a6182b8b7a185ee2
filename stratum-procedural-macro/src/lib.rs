//! Procedural macros used by `stratum`

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derive `metrics_set(&self) -> crate::metric::MetricsSet` for a struct whose named
/// fields are metrics. The type name of each field must be a variant of
/// `crate::metric::MetricValue`, e.g. `Time` or `Count`
#[proc_macro_derive(MetricsSetBuilder)]
pub fn metrics_set_derive(input: TokenStream) -> TokenStream {
    // Parse the input tokens into a syntax tree.
    let input = parse_macro_input!(input as DeriveInput);

    // Used in the quasi-quotation below as `#name`.
    let name = input.ident;

    let insert_recursion = match insert_recursion(&input.data) {
        Ok(insert_recursion) => insert_recursion,
        Err(e) => return e.to_compile_error().into(),
    };

    let expanded = quote!(
        impl #name {
            /// Snapshot of the metrics
            pub fn metrics_set(&self) -> crate::metric::MetricsSet {
                let mut metrics_set = std::collections::BTreeMap::new();
                #insert_recursion
                crate::metric::MetricsSet{
                    name: stringify!(#name),
                    metrics: metrics_set
                }
            }
        }
    );

    expanded.into()
}

fn insert_recursion(data: &Data) -> syn::Result<proc_macro2::TokenStream> {
    match *data {
        Data::Struct(ref ds) => match ds.fields {
            Fields::Named(ref fields) => {
                let recurse = fields.named.iter().filter_map(|f| {
                    let name = f.ident.as_ref()?;
                    let f_ty = &f.ty;
                    Some(quote! {
                        metrics_set.insert(stringify!(#name), crate::metric::MetricValue::#f_ty(self.#name.value()));
                    })
                });
                Ok(quote! {
                    #(#recurse)*
                })
            }
            _ => Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "MetricsSet can only be derived for structs with named fields",
            )),
        },
        Data::Enum(_) | Data::Union(_) => Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "MetricsSet can only be derived for structs with named fields",
        )),
    }
}
