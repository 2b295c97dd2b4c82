use clap::{Parser, Subcommand};
use objc_bridge::{
    types::{decode, decode_method_encoding, decode_property_attributes, TypeDescriptor},
    utils::selector_arity,
    value::layout::{type_layout, HasLayout, LayoutManager},
};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Decode an Objective-C type, method or property encoding"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
    /// Print the decoded structure as JSON instead of a tree
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// A single type encoding, e.g. {CGPoint=dd}
    Type { encoding: String },
    /// A method encoding with stack offsets, e.g. v24@0:8@16
    Method {
        encoding: String,
        /// The selector, used to check the argument count
        #[arg(short, long)]
        selector: Option<String>,
    },
    /// A property attribute string, e.g. T@"NSString",&,N,V_name
    Property { attributes: String },
}

fn print_layout(layout: &LayoutManager, indent: usize) {
    let pad = "  ".repeat(indent);
    match layout {
        LayoutManager::AggregateLayout(a) => {
            for f in &a.fields {
                println!(
                    "{pad}{:<12} offset {:>4}  size {:>4}  {}",
                    f.name,
                    f.position,
                    f.layout.size(),
                    f.layout.type_tag()
                );
                if !matches!(f.layout, LayoutManager::Scalar(_)) {
                    print_layout(&f.layout, indent + 1);
                }
            }
        }
        LayoutManager::ArrayLayout(a) => {
            println!("{pad}[{}] x {}", a.length, a.element.type_tag());
        }
        LayoutManager::BitFieldLayout(b) => {
            println!("{pad}bits {}..{}", b.shift, b.shift + b.width);
        }
        LayoutManager::Scalar(_) => {}
    }
}

fn dump_type(ty: &TypeDescriptor, json: bool) {
    if json {
        match serde_json::to_string_pretty(ty) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("cannot serialize: {e}"),
        }
        return;
    }
    println!("{ty:#?}");
    println!("canonical: {}", ty.encode());
    match type_layout(ty) {
        Ok(layout) => {
            println!(
                "layout: {} bytes, align {} ({})",
                layout.size(),
                layout.align(),
                layout.type_tag()
            );
            print_layout(&layout, 1);
        }
        Err(e) => println!("layout: {e}"),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = match &args.command {
        Command::Type { encoding } => decode(encoding).map(|ty| dump_type(&ty, args.json)),
        Command::Method { encoding, selector } => {
            // Without a selector, count the types after the implicit slots.
            let arity = match selector {
                Some(s) => Ok(selector_arity(s)),
                None => decode_method_encoding(encoding, usize::MAX).map_or_else(
                    |e| match e {
                        objc_bridge::DecodeError::ArgumentCount { found, .. } => Ok(found),
                        other => Err(other),
                    },
                    |sig| Ok(sig.arity()),
                ),
            };
            arity
                .and_then(|n| decode_method_encoding(encoding, n))
                .map(|sig| {
                    if args.json {
                        match serde_json::to_string_pretty(&sig) {
                            Ok(s) => println!("{s}"),
                            Err(e) => eprintln!("cannot serialize: {e}"),
                        }
                        return;
                    }
                    println!("returns: {:?}", sig.return_type);
                    for (i, arg) in sig.arguments.iter().enumerate() {
                        println!("arg {i}: {arg:?}");
                    }
                    println!("canonical: {}", sig.encode());
                })
        }
        Command::Property { attributes } => decode_property_attributes(attributes).map(|attrs| {
            if args.json {
                match serde_json::to_string_pretty(&attrs) {
                    Ok(s) => println!("{s}"),
                    Err(e) => eprintln!("cannot serialize: {e}"),
                }
            } else {
                println!("{attrs:#?}");
                println!("canonical type: {}", attrs.ty.encode());
            }
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
