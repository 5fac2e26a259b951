//! `#[derive(BsonSchema)]`: generates a [`mongors::bson::BsonDocument`] impl
//! mapping a struct's fields to document keys.
//!
//! Field attributes, all under `#[mongors(...)]`:
//!
//! - `rename = "..."` — use a different document key than the field name
//!   (e.g. `#[mongors(rename = "_id")]`).
//! - `skip_serializing_if = "path::to::fn"` — omit the field from
//!   `into_document` when the named function returns `true` for its value.
//! - `flatten` — inline the field's own document fields into the parent
//!   rather than nesting them under the field's key.
//! - `default` — on decode, a missing key uses `Default::default()` instead
//!   of erroring.
//! - `date = "..."` — encode a `chrono::DateTime<Utc>` field with one of the
//!   Coder date strategies (`spec.md` §4.1): `wire_date_time` (BSON
//!   `DateTime`, the default when the attribute is absent and the field
//!   type is `mongors::bson::DateTime`), `ms_i64`, `s_i64`, `ms_f64`,
//!   `s_f64`, or `iso8601_string`.
//! - `uuid = "..."` — encode a `uuid::Uuid` field as `binary` (subtype
//!   `0x04`), `binary_legacy` (subtype `0x03`), or `string` (36-char form).
//! - `bytes = "..."` — encode a `Vec<u8>` field as `binary` (subtype
//!   `0x00`), `base64` (string), or `deferred` (left as a raw `Bson` value,
//!   field type must be `mongors::bson::Bson`).

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, LitStr};

#[proc_macro_derive(BsonSchema, attributes(mongors))]
pub fn derive_bson_schema(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

struct FieldPlan {
    ident: Ident,
    key: String,
    flatten: bool,
    default: bool,
    skip_serializing_if: Option<syn::Path>,
    date: Option<String>,
    uuid: Option<String>,
    bytes: Option<String>,
}

const DATE_STRATEGIES: &[&str] = &["wire_date_time", "ms_i64", "s_i64", "ms_f64", "s_f64", "iso8601_string"];
const UUID_STRATEGIES: &[&str] = &["binary", "binary_legacy", "string"];
const BYTES_STRATEGIES: &[&str] = &["binary", "base64", "deferred"];

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "BsonSchema can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(
            input,
            "BsonSchema requires named fields",
        ));
    };

    let mut plans = Vec::with_capacity(fields.named.len());
    for field in &fields.named {
        let field_ident = field.ident.clone().expect("named field");
        let mut key = field_ident.to_string();
        let mut flatten = false;
        let mut default = false;
        let mut skip_serializing_if = None;
        let mut date = None;
        let mut uuid = None;
        let mut bytes = None;

        for attr in &field.attrs {
            if !attr.path().is_ident("mongors") {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    let value: LitStr = meta.value()?.parse()?;
                    key = value.value();
                } else if meta.path.is_ident("flatten") {
                    flatten = true;
                } else if meta.path.is_ident("default") {
                    default = true;
                } else if meta.path.is_ident("skip_serializing_if") {
                    let value: LitStr = meta.value()?.parse()?;
                    skip_serializing_if = Some(value.parse::<syn::Path>()?);
                } else if meta.path.is_ident("date") {
                    let value: LitStr = meta.value()?.parse()?;
                    let strategy = value.value();
                    if !DATE_STRATEGIES.contains(&strategy.as_str()) {
                        return Err(meta.error(format!(
                            "unknown date strategy `{strategy}`, expected one of {DATE_STRATEGIES:?}"
                        )));
                    }
                    date = Some(strategy);
                } else if meta.path.is_ident("uuid") {
                    let value: LitStr = meta.value()?.parse()?;
                    let strategy = value.value();
                    if !UUID_STRATEGIES.contains(&strategy.as_str()) {
                        return Err(meta.error(format!(
                            "unknown uuid strategy `{strategy}`, expected one of {UUID_STRATEGIES:?}"
                        )));
                    }
                    uuid = Some(strategy);
                } else if meta.path.is_ident("bytes") {
                    let value: LitStr = meta.value()?.parse()?;
                    let strategy = value.value();
                    if !BYTES_STRATEGIES.contains(&strategy.as_str()) {
                        return Err(meta.error(format!(
                            "unknown bytes strategy `{strategy}`, expected one of {BYTES_STRATEGIES:?}"
                        )));
                    }
                    bytes = Some(strategy);
                } else {
                    return Err(meta.error("unrecognised mongors field attribute"));
                }
                Ok(())
            })?;
        }

        plans.push(FieldPlan {
            ident: field_ident,
            key,
            flatten,
            default,
            skip_serializing_if,
            date,
            uuid,
            bytes,
        });
    }

    let into_fields = plans.iter().map(|p| {
        let field_ident = &p.ident;
        let key = &p.key;
        if p.flatten {
            return quote! {
                let nested = ::mongors::bson::BsonDocument::into_document(self.#field_ident)?;
                for (k, v) in nested.into_iter() {
                    __doc.insert(k, v);
                }
            };
        }

        let value_expr = if let Some(strategy) = &p.date {
            quote! { ::mongors::bson::coder::strategies::date_to_bson(self.#field_ident, #strategy)? }
        } else if let Some(strategy) = &p.uuid {
            quote! { ::mongors::bson::coder::strategies::uuid_to_bson(self.#field_ident, #strategy)? }
        } else if let Some(strategy) = &p.bytes {
            if strategy == "deferred" {
                quote! { ::mongors::bson::IntoBson::into_bson(self.#field_ident)? }
            } else {
                quote! { ::mongors::bson::coder::strategies::bytes_to_bson(self.#field_ident, #strategy)? }
            }
        } else {
            quote! { ::mongors::bson::IntoBson::into_bson(self.#field_ident)? }
        };

        if let Some(skip_fn) = &p.skip_serializing_if {
            quote! {
                if !#skip_fn(&self.#field_ident) {
                    __doc.insert(#key, #value_expr);
                }
            }
        } else {
            quote! {
                __doc.insert(#key, #value_expr);
            }
        }
    });

    let from_fields = plans.iter().map(|p| {
        let field_ident = &p.ident;
        let key = &p.key;
        if p.flatten {
            return quote! {
                let #field_ident = ::mongors::bson::BsonDocument::from_document(__doc.clone())?;
            };
        }

        let converted = if let Some(strategy) = &p.date {
            quote! { ::mongors::bson::coder::strategies::date_from_bson(__v.clone(), #strategy)? }
        } else if let Some(strategy) = &p.uuid {
            quote! { ::mongors::bson::coder::strategies::uuid_from_bson(__v.clone(), #strategy)? }
        } else if let Some(strategy) = &p.bytes {
            if strategy == "deferred" {
                quote! { ::mongors::bson::FromBson::from_bson(__v.clone())? }
            } else {
                quote! { ::mongors::bson::coder::strategies::bytes_from_bson(__v.clone(), #strategy)? }
            }
        } else {
            quote! { ::mongors::bson::FromBson::from_bson(__v.clone())? }
        };

        if p.default {
            quote! {
                let #field_ident = match __doc.get(#key) {
                    Some(__v) => #converted,
                    None => ::std::default::Default::default(),
                };
            }
        } else {
            quote! {
                let #field_ident = match __doc.get(#key) {
                    Some(__v) => #converted,
                    None => return ::std::result::Result::Err(::mongors::Error::InvalidArgument(
                        ::std::format!("missing required field `{}`", #key),
                    )),
                };
            }
        }
    });

    let field_idents = plans.iter().map(|p| &p.ident);

    let dummy_const = Ident::new(&format!("__IMPL_BSON_SCHEMA_FOR_{ident}"), Span::call_site());

    Ok(quote! {
        #[allow(non_upper_case_globals)]
        const #dummy_const: () = {
            impl #impl_generics ::mongors::bson::BsonDocument for #ident #ty_generics #where_clause {
                fn from_document(__doc: ::mongors::bson::Document) -> ::mongors::Result<Self> {
                    #(#from_fields)*
                    Ok(Self { #(#field_idents),* })
                }

                fn into_document(self) -> ::mongors::Result<::mongors::bson::Document> {
                    let mut __doc = ::mongors::bson::Document::new();
                    #(#into_fields)*
                    Ok(__doc)
                }
            }
        };
    })
}
