// Entry point for the powledger CLI. Every command loads the node
// configuration first, then opens this node's chain from its own directory.
use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, LevelFilter};
use powledger::{
    convert_address, hash_pub_key, send_tx, validate_address, Blockchain, Command, Config, Opt,
    Server, Wallets,
};
use std::process;

fn main() {
    // Info by default; RUST_LOG still overrides it.
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(opt.config.as_deref())?;

    match opt.command {
        Command::Createblockchain { address } => {
            if !validate_address(&address) {
                return Err(format!("Invalid address: {address}").into());
            }
            let blockchain = Blockchain::create_blockchain(&address, &config)?;
            println!(
                "Done! Genesis block {}",
                HEXLOWER.encode(&blockchain.get_tip_hash())
            );
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(&config.wallet_file)?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::GetBalance { address } => {
            if !validate_address(&address) {
                return Err(format!("Invalid address: {address}").into());
            }
            let blockchain = Blockchain::new_blockchain(&config)?;
            let balance = blockchain.get_balance(&address)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(&config.wallet_file)?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => {
            if !validate_address(&from) {
                return Err(format!("Invalid sender address: {from}").into());
            }
            if !validate_address(&to) {
                return Err(format!("Invalid recipient address: {to}").into());
            }

            let wallets = Wallets::load(&config.wallet_file)?;
            let wallet = wallets
                .get_wallet(&from)
                .ok_or_else(|| format!("No local wallet for {from}"))?;

            let blockchain = Blockchain::new_blockchain(&config)?;
            let transaction = blockchain.new_transaction(wallet, &to, amount)?;

            if mine {
                // The sender collects the reward of the block it mines.
                let block = blockchain.mine_block(&[transaction], &from)?;
                println!("Mined block {}", block.hash_hex());
            } else {
                let seed = config
                    .seed_nodes
                    .first()
                    .ok_or("No seed node configured to relay the transaction")?;
                send_tx(&config, seed, &transaction)?;
            }
            println!("Success!")
        }
        Command::Printchain => {
            let blockchain = Blockchain::new_blockchain(&config)?;
            for block in blockchain.iterator() {
                let block = block?;
                println!("Height: {}", block.get_height());
                println!("Pre block hash: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!("Cur block hash: {}", block.hash_hex());
                println!("Merkle root: {}", HEXLOWER.encode(block.get_merkle_root()));
                println!("Cur block Timestamp: {}", block.get_timestamp());
                println!("Nonce: {}", block.get_nonce());

                for tx in block.get_transactions() {
                    println!("- Transaction txid_hex: {}", tx.id_hex());

                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let pub_key_hash = hash_pub_key(input.get_pub_key());
                            println!(
                                "-- Input txid = {}, vout = {}, from = {}",
                                HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                                convert_address(&pub_key_hash),
                            )
                        }
                    }
                    for output in tx.get_vout() {
                        println!(
                            "-- Output value = {}, to = {}",
                            output.get_value(),
                            convert_address(output.get_pub_key_hash()),
                        )
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let blockchain = Blockchain::new_blockchain(&config)?;
            blockchain.reindex_utxo()?;
            let count = blockchain.get_utxo_set().count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner } => {
            if let Some(addr) = miner {
                println!("Mining is on. Address to receive rewards: {addr}");
                config.mining_address = Some(addr);
                config.validate()?;
            }

            let blockchain = Blockchain::new_blockchain(&config).map_err(|e| {
                format!(
                    "No blockchain for node {} ({e}). Run 'createblockchain' or copy a genesis node's database to {}",
                    config.node_id(),
                    config.db_path().display()
                )
            })?;

            Server::new(config, blockchain).run()?
        }
    }
    Ok(())
}
