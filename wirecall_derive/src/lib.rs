#![recursion_limit = "512"]

extern crate proc_macro;
extern crate proc_macro2;
extern crate quote;
extern crate syn;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote, ToTokens};
use syn::{
    braced,
    ext::IdentExt,
    parenthesized,
    parse::{Parse, ParseStream},
    parse_macro_input, parse_quote,
    punctuated::Punctuated,
    spanned::Spanned,
    Attribute, FnArg, GenericArgument, Ident, Pat, PatType, Path, PathArguments, ReturnType,
    Token, Type, Visibility,
};

/// Accumulates multiple errors into a result.
/// Only use this for recoverable errors, i.e. non-parse errors. Fatal errors should early exit to
/// avoid further complications.
macro_rules! extend_errors {
    ($errors: ident, $e: expr) => {
        match $errors {
            Ok(_) => $errors = Err($e),
            Err(ref mut errors) => errors.extend($e),
        }
    };
}

#[allow(unused_macros)]
macro_rules! d {
    ($v: expr) => {{
        eprintln!("{} = {:#?}", stringify!($v), $v);
    }};
}

struct Interface {
    attrs: Vec<Attribute>,
    vis: Visibility,
    ident: Ident,
    rpcs: Vec<RpcMethod>,
}

struct RpcMethod {
    attrs: Vec<Attribute>,
    ident: Ident,
    /// `&mut RequestContext` taken as the first argument
    context: Option<PatType>,
    args: Vec<PatType>,
    output: ReturnType,
    oneway: bool,
}

fn last_segment_is(ty: &Type, name: &str) -> bool {
    match ty {
        Type::Path(p) => p.path.segments.last().is_some_and(|s| s.ident == name),
        _ => false,
    }
}

fn is_context(ty: &Type) -> bool {
    match ty {
        Type::Reference(r) => r.mutability.is_some() && last_segment_is(&r.elem, "RequestContext"),
        _ => false,
    }
}

/// `Result<T, RemoteException>` yields `T`
fn fallible_ok_type(ty: &Type) -> Option<&Type> {
    let Type::Path(p) = ty else {
        return None;
    };
    let seg = p.path.segments.last()?;
    if seg.ident != "Result" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &seg.arguments else {
        return None;
    };
    let mut types = args.args.iter().filter_map(|a| match a {
        GenericArgument::Type(t) => Some(t),
        _ => None,
    });
    let ok = types.next()?;
    let err = types.next()?;
    last_segment_is(err, "RemoteException").then_some(ok)
}

impl Parse for Interface {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let attrs = input.call(Attribute::parse_outer)?;
        let vis = input.parse()?;
        input.parse::<Token![trait]>()?;
        let ident: Ident = input.parse()?;
        let content;
        braced!(content in input);
        let mut rpcs = Vec::<RpcMethod>::new();
        while !content.is_empty() {
            rpcs.push(content.parse()?);
        }
        let mut ident_errors = Ok(());
        for rpc in &rpcs {
            if matches!(
                rpc.ident.unraw().to_string().as_str(),
                "new" | "from_stub" | "stub" | "stub_mut" | "into_stub"
            ) {
                extend_errors!(
                    ident_errors,
                    syn::Error::new(
                        rpc.ident.span(),
                        format!(
                            "method name conflicts with generated fn `{}Client::{}`",
                            ident.unraw(),
                            rpc.ident.unraw()
                        )
                    )
                );
            }
        }
        ident_errors?;

        Ok(Self {
            attrs,
            vis,
            ident,
            rpcs,
        })
    }
}

impl Parse for RpcMethod {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut attrs = input.call(Attribute::parse_outer)?;
        let before = attrs.len();
        attrs.retain(|a| !a.path().is_ident("oneway"));
        let oneway = attrs.len() != before;

        input.parse::<Token![fn]>()?;
        let ident = input.parse()?;
        let content;
        parenthesized!(content in input);
        let mut context = None;
        let mut args = Vec::new();
        let mut errors = Ok(());
        let mut found_self = false;
        for arg in content.parse_terminated(FnArg::parse, Token![,])? {
            match arg {
                FnArg::Typed(captured) if !matches!(&*captured.pat, Pat::Ident(_)) => {
                    extend_errors!(
                        errors,
                        syn::Error::new(captured.pat.span(), "patterns aren't allowed in RPC args")
                    );
                }
                FnArg::Typed(captured) if is_context(&captured.ty) => {
                    if context.is_some() || !args.is_empty() {
                        extend_errors!(
                            errors,
                            syn::Error::new(
                                captured.ty.span(),
                                "the request context must be the first argument"
                            )
                        );
                    }
                    context = Some(captured);
                }
                FnArg::Typed(captured) => args.push(captured),
                FnArg::Receiver(me) => {
                    found_self = true;
                    if me.mutability.is_some() {
                        extend_errors!(errors, syn::Error::new(me.span(), "self can't be mutable"));
                    }
                    if me.reference.is_none() {
                        extend_errors!(errors, syn::Error::new(me.span(), "self must be &self"));
                    }
                }
            }
        }
        if !found_self {
            extend_errors!(
                errors,
                syn::Error::new(content.span(), "rpc method must start with &self")
            );
        }
        let output: ReturnType = input.parse()?;
        if oneway {
            if let ReturnType::Type(_, ty) = &output {
                extend_errors!(
                    errors,
                    syn::Error::new(ty.span(), "oneway methods can't return a value")
                );
            }
        }
        errors?;
        input.parse::<Token![;]>()?;

        Ok(Self {
            attrs,
            ident,
            context,
            args,
            output,
            oneway,
        })
    }
}

/// A helper attribute to avoid a direct dependency on Serde.
///
/// Adds the following annotations to the annotated item:
///
/// ```ignore
/// #[derive(wirecall::serde::Serialize, wirecall::serde::Deserialize)]
/// #[serde(crate = "wirecall::serde")]
/// # struct Foo;
/// ```
#[proc_macro_attribute]
pub fn derive_serde(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut gen: proc_macro2::TokenStream = quote! {
        #[derive(wirecall::serde::Serialize, wirecall::serde::Deserialize)]
        #[serde(crate = "wirecall::serde")]
    };
    gen.extend(proc_macro2::TokenStream::from(item));
    proc_macro::TokenStream::from(gen)
}

/// Generates:
/// - the interface trait
/// - `<Trait>Client`, a typed client over `wirecall::ClientStub`
/// - `<Trait>Dispatch`, dispatching a call by function id
///
/// Function ids follow declaration order.
#[proc_macro_attribute]
pub fn interface(attr: TokenStream, input: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "wirecall::interface does not support this attr item",
        )
        .to_compile_error()
        .into();
    }

    let unit_type: &Type = &parse_quote!(());
    let Interface {
        ref attrs,
        ref vis,
        ref ident,
        ref rpcs,
    } = parse_macro_input!(input as Interface);

    let return_types = rpcs
        .iter()
        .map(|rpc| match rpc.output {
            ReturnType::Type(_, ref ty) => &**ty,
            ReturnType::Default => unit_type,
        })
        .collect::<Vec<_>>();

    let generator = InterfaceGenerator {
        interface_ident: ident,
        client_ident: &format_ident!("{}Client", ident),
        dispatch_ident: &format_ident!("{}Dispatch", ident),
        interface_name: ident.unraw().to_string(),
        vis,
        attrs,
        rpcs,
        return_types: &return_types,
        client_return_types: &return_types
            .iter()
            .map(|ty| fallible_ok_type(ty).unwrap_or(*ty))
            .collect::<Vec<_>>(),
        arg_pats: &rpcs
            .iter()
            .map(|rpc| rpc.args.iter().map(|arg| &*arg.pat).collect())
            .collect::<Vec<_>>(),
        arg_types: &rpcs
            .iter()
            .map(|rpc| rpc.args.iter().map(|arg| &*arg.ty).collect())
            .collect::<Vec<_>>(),
    };
    let code = generator.into_token_stream();
    // eprintln!("{}", code);
    code.into()
}

// Things needed to generate the interface items: trait, client stub and dispatch.
struct InterfaceGenerator<'a> {
    interface_ident: &'a Ident,
    client_ident: &'a Ident,
    dispatch_ident: &'a Ident,
    interface_name: String,
    vis: &'a Visibility,
    attrs: &'a [Attribute],
    rpcs: &'a [RpcMethod],
    return_types: &'a [&'a Type],
    client_return_types: &'a [&'a Type],
    arg_pats: &'a [Vec<&'a Pat>],
    arg_types: &'a [Vec<&'a Type>],
}

impl InterfaceGenerator<'_> {
    fn trait_interface(&self) -> TokenStream2 {
        let &Self {
            attrs,
            rpcs,
            vis,
            return_types,
            interface_ident,
            ..
        } = self;

        let types_and_fns = rpcs.iter().zip(return_types.iter()).map(
            |(
                RpcMethod {
                    attrs,
                    ident,
                    context,
                    args,
                    ..
                },
                output,
            )| {
                let context = context.iter();
                quote! {
                    #( #attrs )*
                    fn #ident(&self, #( #context, )* #( #args ),*) -> #output;
                }
            },
        );

        quote! {
            #( #attrs )*
            #vis trait #interface_ident {
                #( #types_and_fns )*
            }
        }
    }

    fn trait_dispatch(&self) -> TokenStream2 {
        let &Self {
            interface_ident,
            dispatch_ident,
            ref interface_name,
            rpcs,
            return_types,
            arg_pats,
            arg_types,
            vis,
            ..
        } = self;

        let arms = rpcs
            .iter()
            .zip(return_types.iter())
            .zip(arg_pats.iter().zip(arg_types.iter()))
            .enumerate()
            .map(|(fn_id, ((rpc, output), (pats, types)))| {
                let fn_id = fn_id as i32;
                let method = &rpc.ident;
                let context = rpc.context.as_ref().map(|_| quote!(ctx,));
                let invoke = quote!(self.#method(#context #( #pats ),*));
                let encode = if fallible_ok_type(output).is_some() {
                    quote!(#invoke.and_then(|ret| call.encode_result(rsp, &ret)))
                } else {
                    quote!(call.encode_result(rsp, &#invoke))
                };
                quote! {
                    #fn_id => {
                        let ( #( #pats, )* ): ( #( #types, )* ) = match call.decode_args() {
                            Ok(args) => args,
                            Err(e) => return Some(Err(e)),
                        };
                        #encode
                    }
                }
            });

        quote! {
            /// Dispatches calls targeting this interface by function id.
            #vis trait #dispatch_ident: #interface_ident {
                /// `None` if the call targets another interface
                #[allow(unused_variables)]
                fn dispatch(
                    &self,
                    ctx: &mut wirecall::RequestContext<'_>,
                    call: &wirecall::Call<'_>,
                    rsp: &mut wirecall::RspBuf,
                ) -> Option<Result<(), wirecall::RemoteException>> {
                    if call.sub_interface != #interface_name {
                        return None;
                    }
                    Some(match call.fn_id {
                        #( #arms )*
                        _ => Err(call.unknown_fn()),
                    })
                }
            }

            impl<T: #interface_ident> #dispatch_ident for T {}
        }
    }

    fn struct_client(&self) -> TokenStream2 {
        let &Self {
            vis, client_ident, ..
        } = self;

        quote! {
            #[allow(unused)]
            #[derive(Debug)]
            /// The client stub that makes RPC calls to the server.
            #vis struct #client_ident {
                stub: wirecall::ClientStub,
            }
        }
    }

    fn impl_client_new(&self) -> TokenStream2 {
        let &Self {
            client_ident,
            ref interface_name,
            vis,
            ..
        } = self;

        quote! {
            impl #client_ident {
                /// Returns a client calling the servant bound as `service` at `endpoint`.
                #vis fn new<E: Into<wirecall::Endpoint>>(endpoint: E, service: &str) -> Self {
                    Self::from_stub(wirecall::ClientStub::new(endpoint, service))
                }

                /// Wraps an existing stub, keeping its connection and filters.
                #vis fn from_stub(mut stub: wirecall::ClientStub) -> Self {
                    stub.set_sub_interface(#interface_name);
                    Self { stub }
                }

                /// the underlying stub
                #vis fn stub(&self) -> &wirecall::ClientStub {
                    &self.stub
                }

                /// the underlying stub, for timeouts, filters and remote objects
                #vis fn stub_mut(&mut self) -> &mut wirecall::ClientStub {
                    &mut self.stub
                }

                /// give back the underlying stub
                #vis fn into_stub(self) -> wirecall::ClientStub {
                    self.stub
                }
            }
        }
    }

    fn impl_client_rpc_methods(&self) -> TokenStream2 {
        let &Self {
            client_ident,
            rpcs,
            vis,
            client_return_types,
            arg_pats,
            ..
        } = self;

        let methods = rpcs
            .iter()
            .zip(client_return_types.iter())
            .zip(arg_pats.iter())
            .enumerate()
            .map(|(fn_id, ((rpc, output), pats))| {
                let fn_id = fn_id as i32;
                let RpcMethod {
                    attrs, ident, args, ..
                } = rpc;
                if rpc.oneway {
                    quote! {
                        #[allow(unused)]
                        #( #attrs )*
                        #vis fn #ident(&mut self, #( #args ),*) -> Result<(), wirecall::Error> {
                            self.stub.call_oneway(#fn_id, &( #( #pats, )* ))
                        }
                    }
                } else {
                    quote! {
                        #[allow(unused)]
                        #( #attrs )*
                        #vis fn #ident(&mut self, #( #args ),*) -> Result<#output, wirecall::Error> {
                            self.stub.call(#fn_id, &( #( #pats, )* ))
                        }
                    }
                }
            });

        quote! {
            impl #client_ident {
                #( #methods )*
            }
        }
    }
}

impl ToTokens for InterfaceGenerator<'_> {
    fn to_tokens(&self, output: &mut TokenStream2) {
        output.extend(vec![
            self.trait_interface(),
            self.struct_client(),
            self.impl_client_new(),
            self.impl_client_rpc_methods(),
            self.trait_dispatch(),
        ])
    }
}

fn get_attr(attr_ident: &str, attrs: Vec<syn::Attribute>) -> Option<syn::Attribute> {
    attrs
        .into_iter()
        .find(|attr| attr.path().segments.len() == 1 && attr.path().segments[0].ident == attr_ident)
}

fn get_interfaces_from_attr(attr: Option<syn::Attribute>) -> Result<Vec<Path>, syn::Error> {
    match attr {
        Some(a) => match a.meta {
            syn::Meta::List(ref l) => {
                let paths = l.parse_args_with(Punctuated::<Path, Token![,]>::parse_terminated)?;
                if paths.is_empty() {
                    return Err(syn::Error::new(
                        a.span(),
                        "`interface` attributes need at least one param",
                    ));
                }
                Ok(paths.into_iter().collect())
            }
            _ => Err(syn::Error::new(
                a.span(),
                "`interface` attributes need at least one param",
            )),
        },
        None => Err(syn::Error::new(
            proc_macro2::Span::call_site(),
            "expected `interface` attributes",
        )),
    }
}

/// Implements `wirecall::Servant` for a struct that implements every
/// interface listed in `#[interface(A, B)]`.
#[proc_macro_derive(Servant, attributes(interface))]
pub fn derive_servant(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as syn::DeriveInput);
    let struct_ident = ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    let interface_attr = get_attr("interface", ast.attrs);
    let interfaces = match get_interfaces_from_attr(interface_attr) {
        Err(err) => return err.to_compile_error().into(),
        Ok(s) => s,
    };

    let dispatches = interfaces.into_iter().map(|mut path| {
        if let Some(seg) = path.segments.last_mut() {
            seg.ident = Ident::new(
                &format!("{}Dispatch", seg.ident.to_token_stream()),
                seg.span(),
            );
        }
        path
    });

    let out = quote!(
        impl #impl_generics wirecall::Servant for #struct_ident #ty_generics #where_clause {
            fn invoke(
                &self,
                ctx: &mut wirecall::RequestContext<'_>,
                call: &wirecall::Call<'_>,
                rsp: &mut wirecall::RspBuf,
            ) -> Result<(), wirecall::RemoteException> {
                #(
                    if let Some(ret) = <Self as #dispatches>::dispatch(self, ctx, call, rsp) {
                        return ret;
                    }
                )*
                Err(wirecall::RemoteException::new(
                    wirecall::ErrorCode::UNKNOWN_INTERFACE,
                    format!("unknown interface {:?}", call.sub_interface),
                ))
            }
        }
    );
    // eprintln!("{}", out);
    out.into()
}
