use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    DeriveInput, Expr, Ident, LitInt, LitStr, Result, Token, Type, parse::Parse, parse::ParseStream,
    parse_macro_input,
};

pub(crate) fn expand(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_derive(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_derive(input: &DeriveInput) -> Result<TokenStream2> {
    let cfg = EventAttrConfig::from_attrs(input)?;

    let route = cfg.route.ok_or_else(|| {
        syn::Error::new(
            input.ident.span(),
            "#[derive(MessageEvent)] requires #[message_event(route = ...)]",
        )
    })?;
    for seg in &route {
        if seg.value().is_empty() {
            return Err(syn::Error::new(seg.span(), "route segment must not be empty"));
        }
    }

    let base = match &cfg.parent {
        Some(parent) => quote! {
            <#parent as ::mbus_core::event::MessageEvent>::descriptor().child([#( #route ),*])
        },
        None => quote! {
            ::mbus_core::event::EventDescriptor::new([#( #route ),*])
        },
    };

    let mut options = quote! { ::mbus_core::event::EmitOptions::default() };
    if let Some(scope) = &cfg.scope {
        options = quote! { #options.scope(#scope) };
    }
    if let Some(delay) = &cfg.delay {
        options = quote! { #options.delay(::std::time::Duration::from_millis(#delay)) };
    }
    if let Some(priority) = &cfg.priority {
        options = quote! { #options.priority(#priority) };
    }

    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::mbus_core::event::MessageEvent for #ident #ty_generics #where_clause {
            fn descriptor() -> ::mbus_core::event::EventDescriptor {
                #base.with_options(#options)
            }
        }
    })
}

// -------- parsing --------

#[derive(Default)]
struct EventAttrConfig {
    route: Option<Vec<LitStr>>,
    parent: Option<Type>,
    scope: Option<LitStr>,
    delay: Option<LitInt>,
    priority: Option<LitInt>,
}

impl EventAttrConfig {
    fn from_attrs(input: &DeriveInput) -> Result<Self> {
        let mut cfg = Self::default();
        for attr in input.attrs.iter().filter(|a| a.path().is_ident("message_event")) {
            let pairs: Punctuated<EventAttrKv, Token![,]> =
                attr.parse_args_with(Punctuated::<EventAttrKv, Token![,]>::parse_terminated)?;
            for kv in pairs {
                cfg.apply(kv)?;
            }
        }
        Ok(cfg)
    }

    fn apply(&mut self, kv: EventAttrKv) -> Result<()> {
        let key = kv.key.to_string();
        let duplicate = || syn::Error::new(kv.key.span(), format!("duplicate key '{key}' in attribute"));

        match key.as_str() {
            "route" => {
                if self.route.is_some() {
                    return Err(duplicate());
                }
                self.route = Some(parse_route(kv.value)?);
            }
            "parent" => {
                if self.parent.is_some() {
                    return Err(duplicate());
                }
                self.parent = Some(match kv.value {
                    Expr::Path(p) => Type::Path(syn::TypePath {
                        qself: p.qself,
                        path: p.path,
                    }),
                    other => {
                        return Err(syn::Error::new(other.span(), "expected type path for 'parent'"));
                    }
                });
            }
            "scope" => {
                if self.scope.is_some() {
                    return Err(duplicate());
                }
                self.scope = Some(expect_str(kv.value, "scope")?);
            }
            "delay" => {
                if self.delay.is_some() {
                    return Err(duplicate());
                }
                let lit = expect_int(kv.value, "delay")?;
                lit.base10_parse::<u64>()?;
                self.delay = Some(lit);
            }
            "priority" => {
                if self.priority.is_some() {
                    return Err(duplicate());
                }
                let lit = expect_int(kv.value, "priority")?;
                lit.base10_parse::<u8>()?;
                self.priority = Some(lit);
            }
            _ => {
                return Err(syn::Error::new(
                    kv.key.span(),
                    "unknown key; expected 'route' | 'parent' | 'scope' | 'delay' | 'priority'",
                ));
            }
        }
        Ok(())
    }
}

fn parse_route(value: Expr) -> Result<Vec<LitStr>> {
    match value {
        Expr::Array(arr) => {
            if arr.elems.is_empty() {
                return Err(syn::Error::new(arr.span(), "route must not be empty"));
            }
            arr.elems
                .into_iter()
                .map(|e| expect_str(e, "route"))
                .collect()
        }
        other => Ok(vec![expect_str(other, "route")?]),
    }
}

fn expect_str(value: Expr, key: &str) -> Result<LitStr> {
    match value {
        Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Str(lit),
            ..
        }) => Ok(lit),
        other => Err(syn::Error::new(
            other.span(),
            format!("expected string literal for '{key}'"),
        )),
    }
}

fn expect_int(value: Expr, key: &str) -> Result<LitInt> {
    match value {
        Expr::Lit(syn::ExprLit {
            lit: syn::Lit::Int(lit),
            ..
        }) => Ok(lit),
        other => Err(syn::Error::new(
            other.span(),
            format!("expected integer literal for '{key}'"),
        )),
    }
}

struct EventAttrKv {
    key: Ident,
    #[allow(dead_code)]
    eq: Token![=],
    value: Expr,
}

impl Parse for EventAttrKv {
    fn parse(input: ParseStream) -> Result<Self> {
        Ok(Self {
            key: input.parse()?,
            eq: input.parse()?,
            value: input.parse()?,
        })
    }
}
